//! scaling-server binary.
//!
//! Usage: `scaling-server <port> <workers> <batch-size> <batch-time>`

use scaling_server::{runtime, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration; usage errors exit here with clap's diagnostic
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        batch_size = config.batch_size,
        batch_time_secs = config.batch_time.as_secs(),
        stats_interval_secs = config.stats_interval.as_secs(),
        "Starting scaling server"
    );

    runtime::run(config)?;
    Ok(())
}
