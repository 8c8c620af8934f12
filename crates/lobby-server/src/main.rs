//! lobby-server binary.

use clap::Parser;
use lobby_server::config::{Overrides, ServerConfig};
use lobby_server::LobbyServer;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// lobby-server: authenticated presence and relay hub
#[derive(Parser, Debug)]
#[command(name = "lobby-server", version, about = "Authenticated presence and relay hub")]
struct Cli {
    /// WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP API listen port
    #[arg(long)]
    http_port: Option<u16>,

    /// Trusted token issuer
    #[arg(long)]
    issuer: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.lobby/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting lobby-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = Overrides {
        port: cli.port,
        http_port: cli.http_port,
        issuer: cli.issuer,
    };
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        ws = %config.ws_addr(),
        http = %config.http_addr(),
        issuer = %config.issuer,
        "configuration loaded"
    );

    let server = match LobbyServer::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("lobby-server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("received shutdown signal");
}
