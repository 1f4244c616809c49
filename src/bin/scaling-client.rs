//! scaling-client binary.
//!
//! Usage: `scaling-client <server-host> <server-port> <message-rate>`

use clap::Parser;
use scaling_server::client::{self, ClientArgs};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ClientArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    client::run(args)?;
    Ok(())
}
