use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use porthole_gateway::routes::build_router;
use porthole_gateway::upstream::ProxyWatchUpstream;
use porthole_gateway::{Gateway, GatewayConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "porthole", version, about = "Local Kubernetes API gateway")]
struct Cli {
    /// Address the gateway listens on
    #[arg(long = "addr", env = "PORTHOLE_ADDR", default_value = "127.0.0.1:9191")]
    addr: SocketAddr,

    /// Path of the kubectl-compatible binary used for auth proxies
    #[arg(long = "proxy-binary", env = "PORTHOLE_PROXY_BINARY", default_value = "kubectl")]
    proxy_binary: PathBuf,

    /// Base URL of the Prometheus-compatible metrics backend
    #[arg(long = "metrics-url", env = "PORTHOLE_METRICS_URL")]
    metrics_url: Option<String>,

    /// Cluster id to start an auth proxy for at boot
    #[arg(long = "cluster", requires = "kubeconfig", requires = "server")]
    cluster: Option<String>,

    /// Kubeconfig path for the bootstrap cluster
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,

    /// API server URL for the bootstrap cluster
    #[arg(long = "server")]
    server: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("PORTHOLE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let gateway = Gateway::new(GatewayConfig {
        proxy_binary: cli.proxy_binary,
        metrics_url: cli.metrics_url,
        test_mode: false,
    });

    if let (Some(cluster), Some(kubeconfig), Some(server)) =
        (cli.cluster, cli.kubeconfig, cli.server)
    {
        let port = gateway.start_auth_proxy(cluster.clone(), kubeconfig, server).await?;
        info!(cluster = %cluster, port, "bootstrap auth proxy running");
    }

    let upstream = Arc::new(ProxyWatchUpstream::new(gateway.clone(), reqwest::Client::new()));
    let app = build_router(gateway, upstream);

    let listener = tokio::net::TcpListener::bind(cli.addr).await?;
    info!(addr = %cli.addr, "gateway listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
