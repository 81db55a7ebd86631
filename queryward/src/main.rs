use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use queryward::config::ConfigDirs;
use queryward::state::{self, AppState, Snapshot, StartupError};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, reload};

#[derive(Parser, Debug)]
#[command(
    name = "queryward",
    about = "Tenant-enforcing proxy in front of PromQL and LogQL query APIs"
)]
struct Cli {
    /// Directory holding config.yaml; defaults to /etc/config/config
    /// with ./configs as a local fallback.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory holding labels.yaml for the configmap tenant provider.
    #[arg(long)]
    labels_dir: Option<PathBuf>,
}

fn main() {
    // The subscriber comes up before the config is readable; the filter
    // is swapped to the configured level once loading succeeds, and
    // again on every reload.
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let set_level = move |level: &str| match EnvFilter::try_new(level) {
        Ok(filter) => {
            let _ = reload_handle.reload(filter);
        }
        Err(err) => tracing::warn!(level, error = %err, "invalid log level, keeping previous"),
    };

    if let Err(e) = run(set_level) {
        tracing::error!(error = %e, "startup error");
        process::exit(1);
    }
}

fn run(set_level: impl Fn(&str) + Clone + Send + 'static) -> Result<(), StartupError> {
    let cli = Cli::parse();
    let dirs = ConfigDirs {
        config: cli.config_dir,
        labels: cli.labels_dir,
    };

    let recorder = PrometheusBuilder::new().build_recorder();
    let prometheus = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| StartupError::Metrics(e.to_string()))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        let snapshot = Snapshot::load(&dirs).await?;
        set_level(&snapshot.config.log.level);
        tracing::info!(provider = ?snapshot.config.tenant_provider, "configuration loaded");

        let state = AppState::new(snapshot);
        state::spawn_reload_watcher(state.clone(), dirs, set_level.clone())?;

        queryward::run(state, prometheus).await
    })
}
