use alertmanager_ntfy::{
    Args,
    config::Config,
    dispatch::Dispatcher,
    http::{self, AppState},
    metrics,
    notification::NotificationBuilder,
    ntfy::Ntfy,
};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Register metrics
    metrics::register_metrics()?;

    // Parse config
    let args = Args::parse();
    let config = Config::load(&args)?;
    tracing::info!("Publishing notifications to {}", config.ntfy.url);

    // Wire the pipeline to ntfy
    let sink = Ntfy::new(config.ntfy.clone())?;
    let dispatcher = Dispatcher::new(NotificationBuilder::default(), Arc::new(sink));

    // Start the HTTP server
    http::create_server(config, AppState::new(dispatcher)).await
}
