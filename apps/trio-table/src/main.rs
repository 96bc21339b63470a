mod config;
mod table;
mod telemetry;

use anyhow::Result;
use clap::Parser;

use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = AppConfig::parse();
    telemetry::init_tracing(&config.log_filter);
    tracing::info!(seats = %config.seats, "seating table");

    tokio::select! {
        result = table::run(&config) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted");
            Ok(())
        }
    }
}
