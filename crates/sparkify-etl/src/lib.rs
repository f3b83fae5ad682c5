//! Sequential warehouse pipeline: schema reset, staging bulk loads, star-schema inserts.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sparkify_core::{ClusterConfig, Dialect, WarehouseConfig};
use sparkify_sql::{
    copy_table_queries, create_table_queries, drop_table_queries, insert_table_queries,
    staging_reset_queries, Statement,
};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::Connection;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "sparkify-etl";

/// Executes one statement and commits it before returning.
#[async_trait]
pub trait StatementRunner: Send {
    async fn run(&mut self, statement: &Statement) -> Result<()>;
}

/// The single database connection a pipeline run holds for its lifetime.
pub struct WarehouseSession {
    conn: PgConnection,
}

impl WarehouseSession {
    pub fn connect_options(cluster: &ClusterConfig) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(cluster.host.trim())
            .port(cluster.db_port)
            .database(&cluster.db_name)
            .username(&cluster.db_user)
            .password(&cluster.db_password)
            .ssl_mode(PgSslMode::Prefer)
    }

    pub async fn connect(cluster: &ClusterConfig) -> Result<Self> {
        if !sparkify_core::is_populated(&cluster.host) {
            bail!("cluster.host is not set; run `sparkify status` once the cluster is available");
        }
        let options = Self::connect_options(cluster);
        let conn = PgConnection::connect_with(&options).await.with_context(|| {
            format!(
                "connecting to {}:{}/{}",
                cluster.host.trim(),
                cluster.db_port,
                cluster.db_name
            )
        })?;
        Ok(Self { conn })
    }

    pub async fn connect_url(url: &str) -> Result<Self> {
        let conn = PgConnection::connect(url)
            .await
            .context("connecting to database url")?;
        Ok(Self { conn })
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await.context("closing database connection")
    }
}

#[async_trait]
impl StatementRunner for WarehouseSession {
    async fn run(&mut self, statement: &Statement) -> Result<()> {
        let mut tx = self.conn.begin().await.context("beginning transaction")?;
        sqlx::raw_sql(&statement.sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("executing {}", statement.label()))?;
        tx.commit()
            .await
            .with_context(|| format!("committing {}", statement.label()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DropTables,
    CreateTables,
    ResetStaging,
    LoadStaging,
    InsertTables,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::DropTables => write!(f, "drop-tables"),
            Stage::CreateTables => write!(f, "create-tables"),
            Stage::ResetStaging => write!(f, "reset-staging"),
            Stage::LoadStaging => write!(f, "load-staging"),
            Stage::InsertTables => write!(f, "insert-tables"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub statements: usize,
    pub elapsed: Duration,
}

/// Runs `statements` in order; the first failure aborts the rest of the stage.
pub async fn run_statements<R>(
    runner: &mut R,
    stage: Stage,
    statements: &[Statement],
) -> Result<StageReport>
where
    R: StatementRunner + ?Sized,
{
    let started = Instant::now();
    let total = statements.len();

    async {
        for (index, statement) in statements.iter().enumerate() {
            info!(statement = %statement.label(), position = index + 1, total, "executing");
            runner
                .run(statement)
                .await
                .with_context(|| format!("{stage} aborted at {}", statement.label()))?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .instrument(info_span!("stage", %stage))
    .await?;

    let report = StageReport {
        stage,
        statements: total,
        elapsed: started.elapsed(),
    };
    info!(
        stage = %report.stage,
        statements = report.statements,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "stage complete"
    );
    Ok(report)
}

pub async fn drop_tables<R>(runner: &mut R) -> Result<StageReport>
where
    R: StatementRunner + ?Sized,
{
    run_statements(runner, Stage::DropTables, &drop_table_queries()).await
}

pub async fn create_tables<R>(runner: &mut R, dialect: Dialect) -> Result<StageReport>
where
    R: StatementRunner + ?Sized,
{
    run_statements(runner, Stage::CreateTables, &create_table_queries(dialect)).await
}

/// Drop every table, then create every table.
pub async fn reset_schema<R>(runner: &mut R, dialect: Dialect) -> Result<Vec<StageReport>>
where
    R: StatementRunner + ?Sized,
{
    let dropped = drop_tables(runner).await?;
    let created = create_tables(runner, dialect).await?;
    Ok(vec![dropped, created])
}

/// Recreate the staging tables so each load starts from empty tables.
pub async fn reset_staging_tables<R>(runner: &mut R, dialect: Dialect) -> Result<StageReport>
where
    R: StatementRunner + ?Sized,
{
    run_statements(runner, Stage::ResetStaging, &staging_reset_queries(dialect)).await
}

pub async fn load_staging_tables<R>(runner: &mut R, config: &WarehouseConfig) -> Result<StageReport>
where
    R: StatementRunner + ?Sized,
{
    check_bulk_load(config)?;
    copy_into_staging(runner, config).await
}

async fn copy_into_staging<R>(runner: &mut R, config: &WarehouseConfig) -> Result<StageReport>
where
    R: StatementRunner + ?Sized,
{
    run_statements(runner, Stage::LoadStaging, &copy_table_queries(config)).await
}

fn check_bulk_load(config: &WarehouseConfig) -> Result<()> {
    if config.cluster.dialect != Dialect::Redshift {
        bail!(
            "bulk loads from S3 need the redshift dialect, configured dialect is {}",
            config.cluster.dialect
        );
    }
    if !config.has_iam_role_arn() {
        bail!("iam_role.arn is not set; run `sparkify iam` and copy the printed ARN into the config");
    }
    Ok(())
}

pub async fn insert_tables<R>(runner: &mut R, dialect: Dialect) -> Result<StageReport>
where
    R: StatementRunner + ?Sized,
{
    run_statements(runner, Stage::InsertTables, &insert_table_queries(dialect)).await
}

/// Connect, drop and recreate all tables, disconnect.
pub async fn run_create_tables(config: &WarehouseConfig) -> Result<Vec<StageReport>> {
    let mut session = WarehouseSession::connect(&config.cluster).await?;
    info!("drop existing tables, create new tables");
    let reports = reset_schema(&mut session, config.cluster.dialect).await?;
    session.close().await?;
    Ok(reports)
}

/// Connect, recreate and bulk load the staging tables, populate the star schema, disconnect.
pub async fn run_etl(config: &WarehouseConfig) -> Result<Vec<StageReport>> {
    let mut session = WarehouseSession::connect(&config.cluster).await?;
    let reports = etl(&mut session, config).await?;
    session.close().await?;
    Ok(reports)
}

pub async fn etl<R>(runner: &mut R, config: &WarehouseConfig) -> Result<Vec<StageReport>>
where
    R: StatementRunner + ?Sized,
{
    // Checked before the reset so a bad config leaves staging untouched.
    check_bulk_load(config)?;
    info!("load staging tables");
    let reset = reset_staging_tables(runner, config.cluster.dialect).await?;
    let staged = copy_into_staging(runner, config).await?;
    info!("insert analytical tables");
    let inserted = insert_tables(runner, config.cluster.dialect).await?;
    Ok(vec![reset, staged, inserted])
}
