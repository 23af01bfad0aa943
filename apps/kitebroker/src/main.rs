//! kitebroker entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting kitebroker");

    let settings = config::Settings::load()?;
    settings.validate()?;
    tracing::info!(server = %settings.server, user = %settings.username, "configuration loaded");

    let command = app::Command::parse(std::env::args().skip(1))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(settings, command))
}
