//! AWS provisioning for the warehouse: IAM role, Redshift cluster, network ingress, teardown.
//!
//! Each action is a short sequence of API calls. Some steps log their failure
//! and let the action carry on, the rest abort it.

use std::fmt;

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use aws_sdk_ec2::types::Filter;
use aws_sdk_redshift::types::Cluster;
use sparkify_core::{is_populated, DwhConfig, WarehouseConfig};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "sparkify-infra";

pub const S3_READ_ONLY_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess";
pub const REDSHIFT_SERVICE_PRINCIPAL: &str = "redshift.amazonaws.com";
pub const INGRESS_CIDR: &str = "0.0.0.0/0";

/// Cluster properties shown by `status`, in display order.
pub const CLUSTER_PROPERTIES: [&str; 8] = [
    "ClusterIdentifier",
    "NodeType",
    "ClusterStatus",
    "MasterUsername",
    "DBName",
    "Endpoint",
    "NumberOfNodes",
    "VpcId",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionAction {
    CreateIamRole,
    CreateCluster,
    ClusterStatus,
    OpenIngress,
    DeleteResources,
}

impl fmt::Display for ProvisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionAction::CreateIamRole => write!(f, "create-iam-role"),
            ProvisionAction::CreateCluster => write!(f, "create-cluster"),
            ProvisionAction::ClusterStatus => write!(f, "cluster-status"),
            ProvisionAction::OpenIngress => write!(f, "open-ingress"),
            ProvisionAction::DeleteResources => write!(f, "delete-resources"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("iam_role.arn is not set; run `sparkify iam` before this step")]
    MissingIamRoleArn,
    #[error(
        "cluster.host is not set; run `sparkify iam` and `sparkify redshift`, \
         then wait for the cluster to be available before this step"
    )]
    MissingClusterHost,
}

impl ProvisionAction {
    /// Checks the config fields an action depends on. Runs before any API call.
    pub fn check_preconditions(self, config: &WarehouseConfig) -> Result<(), PreconditionError> {
        if matches!(self, ProvisionAction::CreateCluster | ProvisionAction::OpenIngress)
            && !config.has_iam_role_arn()
        {
            return Err(PreconditionError::MissingIamRoleArn);
        }
        if self == ProvisionAction::OpenIngress && !config.has_cluster_host() {
            return Err(PreconditionError::MissingClusterHost);
        }
        Ok(())
    }
}

/// Trust policy letting Redshift assume the warehouse role.
pub fn assume_role_policy_document() -> String {
    serde_json::json!({
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Effect": "Allow",
            "Principal": {"Service": REDSHIFT_SERVICE_PRINCIPAL}
        }],
        "Version": "2012-10-17"
    })
    .to_string()
}

/// The subset of a described cluster that `status` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    pub properties: Vec<(&'static str, String)>,
    pub status: Option<String>,
    pub endpoint_address: Option<String>,
    pub vpc_id: Option<String>,
    pub iam_role_arn: Option<String>,
}

impl ClusterSummary {
    pub fn from_cluster(cluster: &Cluster) -> Self {
        let endpoint = cluster.endpoint().map(|endpoint| {
            match (endpoint.address(), endpoint.port()) {
                (Some(address), Some(port)) => format!("{address}:{port}"),
                (Some(address), None) => address.to_string(),
                _ => String::new(),
            }
        });
        let values = [
            cluster.cluster_identifier().map(str::to_string),
            cluster.node_type().map(str::to_string),
            cluster.cluster_status().map(str::to_string),
            cluster.master_username().map(str::to_string),
            cluster.db_name().map(str::to_string),
            endpoint,
            cluster.number_of_nodes().map(|n| n.to_string()),
            cluster.vpc_id().map(str::to_string),
        ];
        let properties = CLUSTER_PROPERTIES
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (*key, v)))
            .collect();

        Self {
            properties,
            status: cluster.cluster_status().map(str::to_string),
            endpoint_address: cluster
                .endpoint()
                .and_then(|endpoint| endpoint.address())
                .map(str::to_string),
            vpc_id: cluster.vpc_id().map(str::to_string),
            iam_role_arn: cluster
                .iam_roles()
                .first()
                .and_then(|role| role.iam_role_arn())
                .map(str::to_string),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status.as_deref() == Some("available")
    }

    /// Two-column key/value table.
    pub fn render(&self) -> String {
        let width = self
            .properties
            .iter()
            .map(|(key, _)| key.len())
            .max()
            .unwrap_or(3)
            .max(3);
        let mut out = format!("{:<width$}  Value\n", "Key");
        for (key, value) in &self.properties {
            out.push_str(&format!("{key:<width$}  {value}\n"));
        }
        out
    }
}

/// SDK config pinned to the configured region. Static credentials from the
/// config file win; otherwise the default provider chain applies.
pub async fn sdk_config(config: &WarehouseConfig) -> SdkConfig {
    let loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.aws.region.clone()));
    let loader = if is_populated(&config.aws.key) && is_populated(&config.aws.secret) {
        loader.credentials_provider(Credentials::new(
            config.aws.key.clone(),
            config.aws.secret.clone(),
            None,
            None,
            "sparkify-config",
        ))
    } else {
        loader
    };
    loader.load().await
}

pub struct Provisioner {
    config: WarehouseConfig,
    iam: aws_sdk_iam::Client,
    redshift: aws_sdk_redshift::Client,
    ec2: aws_sdk_ec2::Client,
}

impl Provisioner {
    pub async fn new(config: WarehouseConfig) -> Self {
        info!("create clients for EC2, IAM, and Redshift");
        let sdk = sdk_config(&config).await;
        Self {
            iam: aws_sdk_iam::Client::new(&sdk),
            redshift: aws_sdk_redshift::Client::new(&sdk),
            ec2: aws_sdk_ec2::Client::new(&sdk),
            config,
        }
    }

    pub async fn run(&self, action: ProvisionAction) -> Result<()> {
        action.check_preconditions(&self.config)?;
        match action {
            ProvisionAction::CreateIamRole => self.create_iam_role().await,
            ProvisionAction::CreateCluster => {
                self.create_cluster().await;
                Ok(())
            }
            ProvisionAction::ClusterStatus => {
                self.cluster_status().await;
                Ok(())
            }
            ProvisionAction::OpenIngress => self.open_ingress().await,
            ProvisionAction::DeleteResources => self.delete_resources().await,
        }
    }

    async fn create_iam_role(&self) -> Result<()> {
        let role_name = &self.config.dwh.iam_role_name;
        let created = self
            .iam
            .create_role()
            .path("/")
            .role_name(role_name)
            .description("Allows Redshift clusters to call AWS services on your behalf")
            .assume_role_policy_document(assume_role_policy_document())
            .send()
            .await;
        match created {
            Ok(_) => info!(role_name = %role_name, "created IAM role"),
            Err(err) => continue_after("create IAM role", err.into()),
        }

        info!(role_name = %role_name, policy_arn = S3_READ_ONLY_POLICY_ARN, "attach policy");
        self.iam
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(S3_READ_ONLY_POLICY_ARN)
            .send()
            .await
            .with_context(|| format!("attaching {S3_READ_ONLY_POLICY_ARN} to {role_name}"))?;

        let role = self
            .iam
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .with_context(|| format!("fetching IAM role {role_name}"))?;
        let arn = role
            .role()
            .map(|role| role.arn().to_string())
            .with_context(|| format!("get_role returned no role for {role_name}"))?;

        println!("fill in the [iam_role] arn field of the config file with:");
        println!("{arn}");
        Ok(())
    }

    async fn create_cluster(&self) {
        let dwh = &self.config.dwh;
        let cluster = &self.config.cluster;
        let mut request = self
            .redshift
            .create_cluster()
            .cluster_type(&dwh.cluster_type)
            .node_type(&dwh.node_type)
            .db_name(&cluster.db_name)
            .cluster_identifier(&dwh.cluster_identifier)
            .master_username(&cluster.db_user)
            .master_user_password(&cluster.db_password)
            .iam_roles(self.config.iam_role.arn.trim());
        match node_count(dwh) {
            Ok(Some(nodes)) => request = request.number_of_nodes(nodes),
            Ok(None) => {}
            Err(err) => return continue_after("create redshift cluster", err),
        }

        match request.send().await {
            Ok(_) => info!(
                cluster_identifier = %dwh.cluster_identifier,
                "create redshift cluster"
            ),
            Err(err) => continue_after("create redshift cluster", err.into()),
        }
    }

    async fn describe_cluster(&self) -> Result<ClusterSummary> {
        let identifier = &self.config.dwh.cluster_identifier;
        let output = self
            .redshift
            .describe_clusters()
            .cluster_identifier(identifier)
            .send()
            .await
            .with_context(|| format!("describing cluster {identifier}"))?;
        let cluster = output
            .clusters()
            .first()
            .with_context(|| format!("cluster {identifier} not found"))?;
        Ok(ClusterSummary::from_cluster(cluster))
    }

    async fn cluster_status(&self) {
        info!("check cluster status");
        let summary = match self.describe_cluster().await {
            Ok(summary) => summary,
            Err(err) => return continue_after("check cluster status", err),
        };
        println!("{}", summary.render());

        match (&summary.endpoint_address, summary.is_available()) {
            (Some(endpoint), true) => {
                if let Some(arn) = &summary.iam_role_arn {
                    info!(iam_role_arn = %arn, "cluster role");
                }
                println!("fill in the [cluster] host field of the config file with:");
                println!("HOST :: {endpoint}");
            }
            _ => println!("cluster status is not \"available\" yet"),
        }
    }

    async fn open_ingress(&self) -> Result<()> {
        info!("open an incoming TCP port to access the cluster endpoint");
        let summary = self.describe_cluster().await?;
        if let Err(err) = self.authorize_ingress(summary.vpc_id.as_deref()).await {
            continue_after("open TCP port", err);
        }
        Ok(())
    }

    async fn authorize_ingress(&self, vpc_id: Option<&str>) -> Result<()> {
        let vpc_id = vpc_id.context("cluster has no VPC id")?;
        let groups = self
            .ec2
            .describe_security_groups()
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await
            .with_context(|| format!("listing security groups of {vpc_id}"))?;
        let group_id = groups
            .security_groups()
            .first()
            .and_then(|group| group.group_id())
            .with_context(|| format!("{vpc_id} has no security group"))?;

        let port = i32::from(self.config.cluster.db_port);
        self.ec2
            .authorize_security_group_ingress()
            .group_id(group_id)
            .cidr_ip(INGRESS_CIDR)
            .ip_protocol("tcp")
            .from_port(port)
            .to_port(port)
            .send()
            .await
            .with_context(|| format!("authorizing ingress on {group_id} port {port}"))?;
        info!(group_id, port, "opened TCP port");
        Ok(())
    }

    async fn delete_resources(&self) -> Result<()> {
        info!("clean up your resources");
        let identifier = &self.config.dwh.cluster_identifier;
        let role_name = &self.config.dwh.iam_role_name;

        self.redshift
            .delete_cluster()
            .cluster_identifier(identifier)
            .skip_final_cluster_snapshot(true)
            .send()
            .await
            .with_context(|| format!("deleting cluster {identifier}"))?;

        self.iam
            .detach_role_policy()
            .role_name(role_name)
            .policy_arn(S3_READ_ONLY_POLICY_ARN)
            .send()
            .await
            .with_context(|| format!("detaching {S3_READ_ONLY_POLICY_ARN} from {role_name}"))?;
        self.iam
            .delete_role()
            .role_name(role_name)
            .send()
            .await
            .with_context(|| format!("deleting IAM role {role_name}"))?;

        info!("check cluster status");
        let summary = self.describe_cluster().await?;
        println!("{}", summary.render());
        Ok(())
    }
}

/// Node count for the create request. Redshift rejects one for single-node clusters.
fn node_count(dwh: &DwhConfig) -> Result<Option<i32>> {
    if dwh.cluster_type == "single-node" {
        return Ok(None);
    }
    let nodes = i32::try_from(dwh.num_nodes)
        .with_context(|| format!("dwh.num_nodes {} is out of range", dwh.num_nodes))?;
    Ok(Some(nodes))
}

fn continue_after(step: &str, err: anyhow::Error) {
    let error = format!("{err:#}");
    warn!(step, %error, "provisioning step failed; continuing");
}
