use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Directory searched for config files when no override is given,
/// one subdirectory per file as mounted from a configmap.
const SYSTEM_CONFIG_ROOT: &str = "/etc/config";
/// Local fallback for development checkouts.
const LOCAL_CONFIG_DIR: &str = "./configs";

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub web: WebConfig,
    pub proxy: ProxySettings,
    pub tenant_provider: TenantProviderKind,
    pub loki: UpstreamConfig,
    pub thanos: UpstreamConfig,
    #[serde(default)]
    pub db: Option<DbConfig>,
    #[serde(default)]
    pub dev: DevConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WebConfig {
    pub jwks_cert_url: String,
    #[serde(default)]
    pub token_issuer: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub trusted_root_ca_path: Option<PathBuf>,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Deadline for one upstream round trip, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProxySettings {
    /// The label whose value is enforced in every query expression.
    pub tenant_label: String,
    /// Members of this group bypass rewriting entirely.
    #[serde(default)]
    pub admin_group: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantProviderKind {
    Configmap,
    Mysql,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub use_mutual_tls: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DbConfig {
    pub user: String,
    pub password_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub db_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DevConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub service_account_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

/// Static tenant mappings for the configmap provider, loaded from the
/// labels file next to the main config.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct LabelsConfig {
    #[serde(default)]
    pub users: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    8081
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
}

impl LabelsConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
}

/// Where to look for the `config` and `labels` files. Overrides come
/// from the command line; otherwise the configmap mount points are
/// searched first and a local checkout directory second.
#[derive(Clone, Debug, Default)]
pub struct ConfigDirs {
    pub config: Option<PathBuf>,
    pub labels: Option<PathBuf>,
}

impl ConfigDirs {
    pub fn config_file(&self) -> Result<PathBuf, ConfigError> {
        find_file("config", self.config.as_deref())
    }

    pub fn labels_file(&self) -> Result<PathBuf, ConfigError> {
        find_file("labels", self.labels.as_deref())
    }

    /// Directories the reload watcher should observe. Only directories
    /// that currently resolve to a config file are returned.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        [self.config_file(), self.labels_file()]
            .into_iter()
            .flatten()
            .filter_map(|f| f.parent().map(Path::to_path_buf))
            .collect()
    }
}

fn find_file(name: &str, override_dir: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let file_name = format!("{name}.yaml");
    let mut candidates = Vec::new();
    if let Some(dir) = override_dir {
        candidates.push(dir.join(&file_name));
    } else {
        candidates.push(Path::new(SYSTEM_CONFIG_ROOT).join(name).join(&file_name));
        candidates.push(Path::new(LOCAL_CONFIG_DIR).join(&file_name));
    }
    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| ConfigError::NotFound(file_name))
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config file: {0}")]
    Load(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no {0} found in any config directory")]
    NotFound(String),
}
