//! Application configuration.
//!
//! Built once at startup from defaults, an optional TOML file and a handful of
//! `STASH_*` environment overrides, then passed by reference to everything
//! that needs it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/stash-backup/config.toml";

const REDACTED: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Bucket (or container) that receives every upload
    pub bucket: String,
    /// Directory scanned for `*-backup.yaml` descriptors
    pub descriptor_dir: PathBuf,
    /// Root of the per-project, per-host machine directories
    pub working_dir: PathBuf,
    /// Fail instead of warn when a selector doesn't resolve against a descriptor
    pub strict_descriptors: bool,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    #[serde(default = "default_mysql")]
    pub mysql: DatabaseConfig,
    #[serde(default = "default_postgresql")]
    pub postgresql: DatabaseConfig,
    pub rds: RdsConfig,
    pub report: ReportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// s3, gcs, azure, local or memory
    pub provider: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    // gcs
    pub credentials_path: Option<String>,
    // azure
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    // local
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Treat a size/ETag mismatch after upload as an error rather than a log line
    pub strict_verify: bool,
    /// Delete local artifacts once they have been uploaded
    pub remove_after_upload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RdsConfig {
    pub region: Option<String>,
    pub snapshot_prefix: String,
    pub max_wait_minutes: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Backups older than this many whole days are reported
    pub problem_threshold_days: i64,
    /// Only hosts containing one of these substrings are checked by `check-all`
    pub host_substrings: Vec<String>,
    pub project_blocklist: Vec<String>,
    pub file_blocklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bucket: "backups".to_string(),
            descriptor_dir: PathBuf::from("/etc/stash-backup/"),
            working_dir: PathBuf::from("/tmp/stash-backup/"),
            strict_descriptors: false,
            storage: StorageConfig::default(),
            upload: UploadConfig::default(),
            mysql: default_mysql(),
            postgresql: default_postgresql(),
            rds: RdsConfig::default(),
            report: ReportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: "s3".to_string(),
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key: None,
            secret_key: None,
            credentials_path: None,
            account_name: None,
            account_key: None,
            root: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            strict_verify: false,
            remove_after_upload: true,
        }
    }
}

impl Default for RdsConfig {
    fn default() -> Self {
        Self {
            region: None,
            snapshot_prefix: "stash".to_string(),
            max_wait_minutes: 10,
            poll_interval_secs: 10,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            problem_threshold_days: 2,
            host_substrings: vec!["prod".to_string(), "master-server".to_string()],
            project_blocklist: Vec::new(),
            file_blocklist: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_mysql() -> DatabaseConfig {
    DatabaseConfig {
        host: "localhost".to_string(),
        port: 3306,
        user: "root".to_string(),
        password: None,
    }
}

fn default_postgresql() -> DatabaseConfig {
    DatabaseConfig {
        host: "localhost".to_string(),
        port: 5432,
        user: "postgres".to_string(),
        password: None,
    }
}

impl AppConfig {
    /// Loads configuration from `path` (which must exist) or from the default
    /// location (which may not), then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid configuration")
    }

    /// `lookup` is `std::env::var` in production; empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("STASH_BUCKET") {
            self.bucket = v;
        }
        if let Some(v) = var("STASH_DESCRIPTOR_DIR") {
            self.descriptor_dir = PathBuf::from(v);
        }
        if let Some(v) = var("STASH_WORKING_DIR") {
            self.working_dir = PathBuf::from(v);
        }
        if let Some(v) = var("STASH_STORAGE_PROVIDER") {
            self.storage.provider = v;
        }
        if let Some(v) = var("STASH_MYSQL_PASSWORD") {
            self.mysql.password = Some(v);
        }
        if let Some(v) = var("STASH_PSQL_PASSWORD") {
            self.postgresql.password = Some(v);
        }
        if let Some(v) = var("STASH_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Copy of the configuration safe to print.
    pub fn redacted(&self) -> Self {
        fn hide(value: &Option<String>) -> Option<String> {
            value.as_ref().map(|_| REDACTED.to_string())
        }
        let mut copy = self.clone();
        copy.storage.access_key = hide(&self.storage.access_key);
        copy.storage.secret_key = hide(&self.storage.secret_key);
        copy.storage.account_key = hide(&self.storage.account_key);
        copy.mysql.password = hide(&self.mysql.password);
        copy.postgresql.password = hide(&self.postgresql.password);
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

pub fn write_example_config(output_path: &Path) -> Result<()> {
    fs::write(output_path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", output_path.display()))
}

pub const EXAMPLE_CONFIG: &str = r#"# stash-backup configuration

# Bucket that receives every upload
bucket = "backups"

# Where `*-backup.yaml` descriptors live
descriptor_dir = "/etc/stash-backup/"

# Machine directories are created under here: <working_dir>/<project>/<hostname>
working_dir = "/tmp/stash-backup/"

# Fail when a `kind.name` selector doesn't match a descriptor (default: warn and continue)
strict_descriptors = false

[storage]
# Provider: s3, gcs, azure, local, memory
provider = "s3"
region = "us-east-1"
# endpoint = "https://s3.example.com"   # S3-compatible stores only
# access_key = "your-access-key"        # omit to use the default AWS credential chain
# secret_key = "your-secret-key"

# gcs
# credentials_path = "/path/to/service-account-key.json"

# azure
# account_name = "your-account"
# account_key = "your-key"

# local
# root = "/srv/backups"

[upload]
# Fail the upload when the remote size/ETag doesn't match the local file
strict_verify = false
remove_after_upload = true

[mysql]
host = "localhost"
port = 3306
user = "root"
# password = "..."   # or STASH_MYSQL_PASSWORD

[postgresql]
host = "localhost"
port = 5432
user = "postgres"
# password = "..."   # or STASH_PSQL_PASSWORD

[rds]
# region = "us-east-1"
snapshot_prefix = "stash"
max_wait_minutes = 10
poll_interval_secs = 10

[report]
problem_threshold_days = 2
host_substrings = ["prod", "master-server"]
project_blocklist = []
file_blocklist = []

[logging]
level = "info"
"#;
