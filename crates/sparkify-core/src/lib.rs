//! Warehouse configuration and table catalog shared by the Sparkify crates.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "sparkify-core";

pub const DEFAULT_CONFIG_PATH: &str = "confs/dwh.toml";
pub const CONFIG_PATH_ENV: &str = "SPARKIFY_CONFIG";
pub const DEFAULT_REGION: &str = "us-west-2";

pub const ENV_DB_PASSWORD: &str = "SPARKIFY_DB_PASSWORD";
pub const ENV_AWS_KEY: &str = "SPARKIFY_AWS_KEY";
pub const ENV_AWS_SECRET: &str = "SPARKIFY_AWS_SECRET";

/// Every relation the warehouse owns, staging and star schema alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    StagingEvents,
    StagingSongs,
    Songplays,
    Users,
    Songs,
    Artists,
    Time,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::StagingEvents,
        Table::StagingSongs,
        Table::Songplays,
        Table::Users,
        Table::Songs,
        Table::Artists,
        Table::Time,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::StagingEvents => "staging_events",
            Table::StagingSongs => "staging_songs",
            Table::Songplays => "songplays",
            Table::Users => "users",
            Table::Songs => "songs",
            Table::Artists => "artists",
            Table::Time => "time",
        }
    }

    pub fn is_staging(self) -> bool {
        matches!(self, Table::StagingEvents | Table::StagingSongs)
    }

    /// Columns that identify a row for the idempotent inserts.
    pub fn natural_key(self) -> &'static [&'static str] {
        match self {
            Table::StagingEvents | Table::StagingSongs => &[],
            Table::Songplays => &["start_time", "user_id", "session_id"],
            Table::Users => &["user_id"],
            Table::Songs => &["song_id"],
            Table::Artists => &["artist_id"],
            Table::Time => &["start_time"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// SQL flavour of the target database.
///
/// Redshift does not enforce key constraints, so inserts there guard with an
/// anti-join. Postgres enforces them and the inserts use `ON CONFLICT DO NOTHING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Redshift,
    Postgres,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Redshift => write!(f, "redshift"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}

impl FromStr for Dialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redshift" => Ok(Dialect::Redshift),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            other => Err(ConfigError::Invalid(format!(
                "unsupported dialect: {other}. Supported: redshift, postgres"
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Connection settings for the warehouse endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Filled in after `status` reports the cluster endpoint.
    #[serde(default)]
    pub host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub db_port: u16,
    #[serde(default)]
    pub dialect: Dialect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub key: String,
    pub secret: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

/// Cluster sizing and naming used by the provisioning commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DwhConfig {
    pub cluster_type: String,
    pub num_nodes: u32,
    pub node_type: String,
    pub cluster_identifier: String,
    pub iam_role_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IamRoleConfig {
    /// Filled in after `iam` prints the created role ARN.
    #[serde(default)]
    pub arn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub log_data: String,
    pub log_jsonpath: String,
    pub song_data: String,
}

/// Top-level configuration, loaded once at startup and handed to each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub cluster: ClusterConfig,
    pub aws: AwsConfig,
    pub dwh: DwhConfig,
    #[serde(default)]
    pub iam_role: IamRoleConfig,
    pub s3: S3Config,
}

/// Lookup for environment overrides; swapped for a map in tests.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl WarehouseConfig {
    /// `--config` wins, then `SPARKIFY_CONFIG`, then `confs/dwh.toml`.
    pub fn resolve_path(explicit: Option<PathBuf>, env: &dyn EnvSource) -> PathBuf {
        explicit
            .or_else(|| env.get(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Read, parse, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>, env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&text, &path.display().to_string())?;
        config.apply_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(text, "<inline>")?;
        config.validate()?;
        Ok(config)
    }

    fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self, env: &dyn EnvSource) {
        if let Some(password) = env.get(ENV_DB_PASSWORD) {
            self.cluster.db_password = password;
        }
        if let Some(key) = env.get(ENV_AWS_KEY) {
            self.aws.key = key;
        }
        if let Some(secret) = env.get(ENV_AWS_SECRET) {
            self.aws.secret = secret;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.db_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster.db_name must not be empty".into()));
        }
        if self.cluster.db_user.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster.db_user must not be empty".into()));
        }
        if self.cluster.db_port == 0 {
            return Err(ConfigError::Invalid("cluster.db_port must be greater than 0".into()));
        }
        if self.aws.region.trim().is_empty() {
            return Err(ConfigError::Invalid("aws.region must not be empty".into()));
        }
        if self.dwh.num_nodes == 0 {
            return Err(ConfigError::Invalid("dwh.num_nodes must be at least 1".into()));
        }
        // The Redshift API takes the node count as a signed 32-bit integer.
        if i32::try_from(self.dwh.num_nodes).is_err() {
            return Err(ConfigError::Invalid(format!(
                "dwh.num_nodes must be at most {}",
                i32::MAX
            )));
        }
        if self.dwh.cluster_type == "multi-node" && self.dwh.num_nodes < 2 {
            return Err(ConfigError::Invalid(
                "dwh.num_nodes must be at least 2 for a multi-node cluster".into(),
            ));
        }
        if self.dwh.cluster_type == "single-node" && self.dwh.num_nodes > 1 {
            warn!(
                num_nodes = self.dwh.num_nodes,
                "dwh.num_nodes is ignored for a single-node cluster"
            );
        }
        Ok(())
    }

    pub fn has_iam_role_arn(&self) -> bool {
        is_populated(&self.iam_role.arn)
    }

    pub fn has_cluster_host(&self) -> bool {
        is_populated(&self.cluster.host)
    }
}

/// Placeholder values such as `''` count as unset.
pub fn is_populated(value: &str) -> bool {
    !value
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .trim()
        .is_empty()
}
