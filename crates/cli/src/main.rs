use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use configmaster_core::{Connection, Settings};
use configmaster_kubehub::{Cluster, KubeCluster};

#[derive(Parser, Debug)]
#[command(name = "configmaster", version, about = "Roll Deployments when the ConfigMaps and Secrets they use change")]
struct Cli {
    /// Namespace to watch (default: "default")
    #[arg(long = "namespace", env = "CONFIGMASTER_NAMESPACE")]
    namespace: Option<String>,

    /// Debounce delay in whole seconds (default: 5)
    #[arg(long = "delay", env = "CONFIGMASTER_DELAY")]
    delay: Option<String>,

    /// API server URL, required when not running inside a cluster
    #[arg(long = "host", env = "CONFIGMASTER_HOST")]
    host: Option<String>,

    /// Log filter directives
    #[arg(long = "log", env = "CONFIGMASTER_LOG", default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address (host:port); off when unset
    #[arg(long = "metrics-addr", env = "CONFIGMASTER_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

fn init_tracing(directives: &str) {
    let (filter, rejected) = match EnvFilter::try_new(directives) {
        Ok(f) => (f, None),
        Err(e) => (EnvFilter::new("info"), Some(e)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    if let Some(e) = rejected {
        warn!(directives, error = %e, "invalid log filter; using info");
    }
}

fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        info!("metrics exporter disabled; set CONFIGMASTER_METRICS_ADDR to serve counters");
        return Ok(());
    };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("starting metrics exporter on {}", addr))?;
    info!(%addr, "serving Prometheus metrics");
    Ok(())
}

fn env_present(key: &str) -> bool {
    std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr)?;

    let in_cluster = env_present("KUBERNETES_SERVICE_HOST") && env_present("KUBERNETES_SERVICE_PORT");
    let connection = Connection::select(in_cluster, cli.host.as_deref())?;
    let settings = Settings::new(cli.namespace.as_deref(), cli.delay.as_deref(), connection)?;

    let client = configmaster_kubehub::connect(&settings.connection).await?;
    info!(
        endpoint = %settings.connection.describe(),
        ns = %settings.namespace,
        delay_secs = settings.delay.as_secs(),
        "configmaster connecting"
    );
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(client, &settings.namespace));

    tokio::select! {
        res = configmaster_controller::run(cluster, settings.delay) => {
            if let Err(e) = &res {
                error!(error = ?e, "controller stopped");
            }
            res
        }
        _ = signal::ctrl_c() => {
            info!("interrupt received; pending countdowns dropped");
            Ok(())
        }
    }
}
