//! Flippy realtime hub server entry point.

mod app;
mod config;
mod server;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting Flippy hub server"
    );

    let config = config::Config::load()?;
    tracing::info!(listen = %config.listen, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("hub server shut down cleanly");
    Ok(())
}
