use clap::Parser;
use std::{path::PathBuf, time::Duration};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};

pub mod alertmanager;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod metrics;
pub mod notification;
pub mod ntfy;
pub mod query;
pub mod schema;

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file, built-in defaults are used when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "NTFY_ALERT_PORT")]
    pub port: Option<u16>,

    /// Base URL of the ntfy server (overrides the config file)
    #[arg(short = 'u', long, env = "NTFY_ALERT_URL")]
    pub ntfy_url: Option<String>,
}

/// Handle signals, draining in-flight requests before the server stops
pub fn signal_handler(handle: axum_server::Handle) {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
            _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
        }

        handle.graceful_shutdown(Some(Duration::from_secs(30)));
    });
}
