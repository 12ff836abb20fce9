//! Server binary: wires the driver, connection manager, distributor, and
//! HTTP surface together and runs until interrupted.

use clap::Parser;
use scanbridge::config::Settings;
use scanbridge::connection::ConnectionManager;
use scanbridge::distributor::{LatestScanCache, ScanDistributor};
use scanbridge::driver;
use scanbridge::error::AppResult;
use scanbridge::server::{self, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "scanbridge",
    version,
    about = "Bridge a mass spectrometer's live scan stream to remote viewers"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/scanbridge.toml")]
    config: PathBuf,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Force the mock driver regardless of configuration.
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(&args.config)?;
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
        settings.validate()?;
    }
    if args.mock {
        settings.instrument.driver = "mock".to_string();
    }

    init_tracing(&settings.server.log_level);
    info!(
        "scanbridge starting (driver: {}, bind: {})",
        settings.instrument.driver, settings.server.bind
    );

    let distributor = ScanDistributor::new(&settings.telemetry);
    let latest = Arc::new(LatestScanCache::attach(&distributor));
    let factory = driver::factory_for(&settings.instrument);
    let connection = ConnectionManager::new(
        factory,
        settings.instrument.instrument_index,
        distributor.clone(),
    );

    let state = AppState {
        connection: connection.clone(),
        distributor,
        latest,
    };

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Shutdown signal received");
    };

    server::serve(state, &settings.server.bind, shutdown).await?;

    // Release instrument resources before exit.
    if let Err(err) = connection.disconnect().await {
        warn!("Disconnect during shutdown: {err}");
    }
    info!("scanbridge stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
