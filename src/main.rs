//! Arena Gateway binary entry point.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use arena_gateway::config::GatewayConfig;
use arena_gateway::server::GatewayServer;

/// Command-line configuration for the gateway.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on (default: 8900, or ARENA_GATEWAY_PORT env var)
    #[arg(short, long, env = "ARENA_GATEWAY_PORT", default_value = "8900")]
    port: u16,

    /// Bind address (default: 127.0.0.1)
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env();
    config.listen_addr = format!("{}:{}", cli.bind, cli.port);

    info!(
        addr = %config.listen_addr,
        session_timeout_secs = config.session_timeout.as_secs(),
        backend_timeout_secs = config.backend_timeout.as_secs(),
        traffic_capacity = config.traffic_capacity,
        "Arena gateway starting"
    );

    let shutdown = CancellationToken::new();

    let sigint_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                sigint_token.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let sigterm_token = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    sigterm_token.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    let server = GatewayServer::new(config)?;
    server.run(shutdown).await
}
