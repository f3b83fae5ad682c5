use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sparkify_core::{StdEnvSource, WarehouseConfig};
use sparkify_etl::StageReport;
use sparkify_infra::{ProvisionAction, Provisioner};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sparkify")]
#[command(about = "Provision a Redshift cluster and load the Sparkify star schema")]
struct Cli {
    /// Config file (defaults to $SPARKIFY_CONFIG, then confs/dwh.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Create the IAM role Redshift uses to read from S3
    Iam,
    /// Create the Redshift cluster
    Redshift,
    /// Check the Redshift cluster status
    Status,
    /// Open the incoming TCP port of the cluster endpoint
    Tcp,
    /// Delete the cluster and the IAM role
    Delete,
    /// Drop and recreate every warehouse table
    CreateTables,
    /// Load the staging tables and populate the star schema
    Etl,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_reports(reports: &[StageReport]) {
    for report in reports {
        println!(
            "{} complete: statements={} elapsed_ms={}",
            report.stage,
            report.statements,
            report.elapsed.as_millis()
        );
    }
}

async fn provision(config: WarehouseConfig, action: ProvisionAction) -> Result<()> {
    // Fail on missing config before any AWS client exists.
    action.check_preconditions(&config)?;
    Provisioner::new(config).await.run(action).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let path = WarehouseConfig::resolve_path(cli.config, &StdEnvSource);
    let config = WarehouseConfig::load(&path, &StdEnvSource)
        .with_context(|| format!("loading config from {}", path.display()))?;
    info!(config = %path.display(), command = ?cli.command, "starting");

    match cli.command {
        Commands::Iam => provision(config, ProvisionAction::CreateIamRole).await?,
        Commands::Redshift => provision(config, ProvisionAction::CreateCluster).await?,
        Commands::Status => provision(config, ProvisionAction::ClusterStatus).await?,
        Commands::Tcp => provision(config, ProvisionAction::OpenIngress).await?,
        Commands::Delete => provision(config, ProvisionAction::DeleteResources).await?,
        Commands::CreateTables => {
            let reports = sparkify_etl::run_create_tables(&config).await?;
            print_reports(&reports);
        }
        Commands::Etl => {
            let reports = sparkify_etl::run_etl(&config).await?;
            print_reports(&reports);
        }
    }

    Ok(())
}
