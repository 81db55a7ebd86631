pub mod admin_service;
pub mod auth;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod rewrite;
pub mod router;
pub mod service;
pub mod state;
pub mod tenants;
pub mod upstreams;

use crate::admin_service::AdminService;
use crate::service::ProxyService;
use crate::state::{AppState, StartupError};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;

/// Binds both listeners and serves until one of them fails. The public
/// listener carries the query routes, the admin listener health and
/// metrics.
pub async fn run(state: AppState, prometheus: PrometheusHandle) -> Result<(), StartupError> {
    let config = state.snapshot().config.clone();

    let public = TcpListener::bind(("0.0.0.0", config.web.proxy_port)).await?;
    let admin = TcpListener::bind(("0.0.0.0", config.web.metrics_port)).await?;
    tracing::info!(
        proxy_port = config.web.proxy_port,
        metrics_port = config.web.metrics_port,
        "listening"
    );

    tokio::try_join!(
        shared::http::serve(public, ProxyService::new(state)),
        shared::http::serve(admin, AdminService::new(prometheus)),
    )?;
    Ok(())
}
