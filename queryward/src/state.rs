//! Process-wide state. Everything a request needs is bound into one
//! immutable [`Snapshot`]; configuration reload builds a fresh snapshot
//! and swaps the reference, so readers see either the old or the new
//! value and never a torn mix. No lock is held across an await point.

use crate::auth::{AuthError, TokenVerifier};
use crate::config::{Config, ConfigDirs, ConfigError, LabelsConfig, TenantProviderKind};
use crate::tenants::TenantProvider;
use crate::upstreams::{UpstreamError, Upstreams};
use notify::{RecursiveMode, Watcher};
use sqlx::mysql::MySqlPoolOptions;
use std::sync::{Arc, RwLock};
use thiserror::Error;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("JWKS prefetch failed: {0}")]
    Jwks(#[from] AuthError),
    #[error("could not read service account token: {0}")]
    ServiceToken(std::io::Error),
    #[error("dev mode is enabled but dev.service_account_token is not set")]
    MissingDevToken,
    #[error("tenant_provider is mysql but the db section is missing")]
    MissingDbConfig,
    #[error("could not read db password: {0}")]
    DbPassword(std::io::Error),
    #[error("db connection setup failed: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("metrics recorder setup failed: {0}")]
    Metrics(String),
    #[error("config watcher setup failed: {0}")]
    Watcher(String),
}

pub struct Snapshot {
    pub config: Config,
    pub verifier: TokenVerifier,
    pub provider: TenantProvider,
    pub upstreams: Upstreams,
    pub service_token: String,
}

impl Snapshot {
    /// Builds a complete snapshot from the config directories. Called
    /// at startup and again on every reload; any failure here leaves
    /// the previous snapshot in place.
    pub async fn load(dirs: &ConfigDirs) -> Result<Self, StartupError> {
        let config = Config::from_file(&dirs.config_file()?)?;

        let provider = match config.tenant_provider {
            TenantProviderKind::Configmap => {
                let labels = LabelsConfig::from_file(&dirs.labels_file()?)?;
                TenantProvider::configmap(labels, config.proxy.admin_group.clone())
            }
            TenantProviderKind::Mysql => {
                let db = config.db.as_ref().ok_or(StartupError::MissingDbConfig)?;
                let password = std::fs::read_to_string(&db.password_path)
                    .map_err(StartupError::DbPassword)?;
                let dsn = format!(
                    "mysql://{}:{}@{}:{}/{}",
                    db.user,
                    password.trim(),
                    db.host,
                    db.port,
                    db.db_name
                );
                let pool = MySqlPoolOptions::new().connect_lazy(&dsn)?;
                TenantProvider::mysql(pool, config.proxy.admin_group.clone())
            }
        };

        let upstreams = Upstreams::try_new(&config)?;

        let verifier = TokenVerifier::new(
            config.web.jwks_cert_url.clone(),
            config.web.token_issuer.clone(),
        );
        verifier.prefetch().await?;

        let service_token = if config.dev.enabled {
            config
                .dev
                .service_account_token
                .clone()
                .ok_or(StartupError::MissingDevToken)?
        } else {
            std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)
                .map_err(StartupError::ServiceToken)?
                .trim()
                .to_string()
        };

        Ok(Snapshot {
            config,
            verifier,
            provider,
            upstreams,
            service_token,
        })
    }
}

/// Cloneable handle to the current snapshot.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl AppState {
    pub fn new(snapshot: Snapshot) -> Self {
        AppState {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn replace(&self, snapshot: Snapshot) {
        *self.inner.write().unwrap_or_else(|err| err.into_inner()) = Arc::new(snapshot);
    }
}

/// Watches the config directories and rebuilds the snapshot on change.
/// A failed reload keeps the previous snapshot. `on_log_level` receives
/// the configured level so the subscriber filter can follow it.
pub fn spawn_reload_watcher(
    state: AppState,
    dirs: ConfigDirs,
    on_log_level: impl Fn(&str) + Send + 'static,
) -> Result<(), StartupError> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })
    .map_err(|e| StartupError::Watcher(e.to_string()))?;

    for path in dirs.watch_paths() {
        watcher
            .watch(&path, RecursiveMode::Recursive)
            .map_err(|e| StartupError::Watcher(e.to_string()))?;
    }

    let runtime = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        // The watcher lives as long as this thread.
        let _watcher = watcher;
        while let Ok(event) = rx.recv() {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "config watch error");
                    continue;
                }
            };
            if !(event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()) {
                continue;
            }

            match runtime.block_on(Snapshot::load(&dirs)) {
                Ok(snapshot) => {
                    on_log_level(&snapshot.config.log.level);
                    state.replace(snapshot);
                    tracing::info!("configuration reloaded");
                }
                Err(err) => {
                    tracing::error!(error = %err, "config reload failed, keeping previous snapshot");
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_the_whole_snapshot() {
        let make = |label: &str| Snapshot {
            config: test_config(label),
            verifier: TokenVerifier::new("http://127.0.0.1:1/certs", None),
            provider: TenantProvider::configmap(LabelsConfig::default(), None),
            upstreams: Upstreams::try_new(&test_config(label)).unwrap(),
            service_token: "t".to_string(),
        };

        let state = AppState::new(make("namespace"));
        assert_eq!(state.snapshot().config.proxy.tenant_label, "namespace");

        state.replace(make("tenant_id"));
        assert_eq!(state.snapshot().config.proxy.tenant_label, "tenant_id");
    }

    fn test_config(tenant_label: &str) -> Config {
        use crate::config::*;
        Config {
            web: WebConfig {
                jwks_cert_url: "http://127.0.0.1:1/certs".into(),
                token_issuer: None,
                insecure_skip_verify: false,
                trusted_root_ca_path: None,
                proxy_port: 8080,
                metrics_port: 8081,
                request_timeout_seconds: 30,
            },
            proxy: ProxySettings {
                tenant_label: tenant_label.into(),
                admin_group: None,
            },
            tenant_provider: TenantProviderKind::Configmap,
            loki: UpstreamConfig {
                url: "http://127.0.0.1:3100".into(),
                cert: None,
                key: None,
                use_mutual_tls: false,
            },
            thanos: UpstreamConfig {
                url: "http://127.0.0.1:9091".into(),
                cert: None,
                key: None,
                use_mutual_tls: false,
            },
            db: None,
            dev: DevConfig::default(),
            log: LogConfig::default(),
        }
    }
}
