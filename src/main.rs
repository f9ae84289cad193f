mod bluetooth;
mod config;
mod database;
mod models;
mod utils;

#[cfg(test)]
mod test_utils;

use log::{error, info, warn};

use bluetooth::{open_source, AddressFilter, ScanError, ScanSession, ScanState};
use config::SensorConfig;
use database::{connect_with_retry, Persister};
use models::Reading;
use utils::format_scan_summary;

/// Resolves on Ctrl+C. Never resolves if the handler can't be installed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Interrupted, ending scan");
}

/// Store the session's readings. Failures are reported, never fatal.
async fn persist(config: &SensorConfig, readings: &[Reading]) {
    let Some(database) = &config.database else {
        warn!("DATABASE_URL not set, readings are not stored");
        return;
    };
    if readings.is_empty() {
        warn!("No data collected during this scan!");
        return;
    }

    let mut sink = match connect_with_retry(database).await {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            return;
        }
    };

    let persister = Persister::new(config.persist_extended, config.measurement_prefix.clone());
    if let Err(e) = persister.write(&mut sink, readings).await {
        error!("Failed to store readings: {}", e);
    }
}

async fn run(config: SensorConfig) -> Result<(), ScanError> {
    let filter = AddressFilter::new(&config.sensors);
    let mut source = open_source(config.backend);

    let outcome = ScanSession::new(&filter, config.poll_interval)
        .run(source.as_mut(), config.scan_duration, shutdown_signal())
        .await?;
    // Release the adapter before touching the database
    drop(source);

    info!("{}", format_scan_summary(&outcome, filter.len()));
    if outcome.state != ScanState::Complete {
        for sensor in &config.sensors {
            if !outcome.readings.iter().any(|r| r.address == sensor.address) {
                warn!("No reading from {} ({})", sensor.name, sensor.address);
            }
        }
    }

    tokio::select! {
        _ = persist(&config, &outcome.readings) => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted while storing, batch abandoned");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SensorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = run(config).await {
        error!("Fatal error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
