mod app;
mod config;
mod dispatch;
mod health;
mod safe_dns;
mod state;
mod target_filter;
mod tls;
mod tunnel;

use clap::Parser;
use config::Config;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let config = Config::parse();
    init_tracing(&config);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fluidity-server starting");

    match app::run(config).await {
        Ok(()) => {
            tracing::info!("fluidity-server exited cleanly");
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %err, "fluidity-server exited with error");
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
    }
}
