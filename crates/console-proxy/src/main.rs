//! console-proxy: browser console gateway.
//!
//! Accepts encrypted console tokens, opens CONNECT tunnels to hypervisor hosts
//! over TLS, and relays the console byte stream to the browser over a
//! WebSocket.

mod config;
mod relay;
mod server;
mod session;
mod transport;
mod tunnel;

#[cfg(test)]
mod testutil;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// console-proxy: WebSocket to TLS console tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "console-proxy", version, about = "WebSocket to TLS console tunnel gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    hostname: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.console-proxy/config.toml")]
    config: String,

    /// Directory served under /static
    #[arg(long)]
    static_dir: Option<String>,

    /// Token key (base64url)
    #[arg(long)]
    key: Option<String>,

    /// Token IV (base64url)
    #[arg(long)]
    iv: Option<String>,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting console-proxy");

    let overrides = ConfigOverrides {
        hostname: cli.hostname,
        port: cli.port,
        static_dir: cli.static_dir,
        key: cli.key,
        iv: cli.iv,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if !server_config.secret.is_set() {
        warn!("no encryption secret configured; tokens are rejected until one is set");
    }

    if let Err(e) = server::run(server_config, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("console-proxy stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
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
