//! Standalone server entry point.
//!
//! Usage: `lattice_server [config.toml]`. With no argument the
//! default development configuration is used, which rejects every
//! login until accounts are configured.

use lattice::{App, Config};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => {
            info!("no configuration file given; using defaults");
            Config::default()
        }
    };

    let app = App::bind(config).await?;
    tokio::signal::ctrl_c().await?;
    app.shutdown();
    Ok(())
}
