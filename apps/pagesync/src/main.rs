//! pagesync entry point.

mod app;
mod config;
mod display;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting pagesync");

    let config_arg = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::Config::load(config_arg.as_deref())?;
    tracing::info!(
        source = %config.source.display(),
        destination = %config.destination.display(),
        object = %config.object_name(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))
}
