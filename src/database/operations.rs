/// Writing scan results as measurement rows
use async_trait::async_trait;
use log::{debug, error, info};
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;

use crate::models::{MacAddress, Reading};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Invalid database URL: {0}")]
    Url(String),
    #[error("TLS setup error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("Max retries exceeded ({0} attempts)")]
    RetriesExhausted(usize),
    #[error("{0}")]
    Sink(String),
    #[error("Writing {kind} for {address} failed, batch rolled back: {source}")]
    BatchRolledBack {
        address: MacAddress,
        kind: MeasurementKind,
        source: Box<PersistError>,
    },
    #[error("Commit failed, batch rolled back: {source}")]
    CommitRolledBack { source: Box<PersistError> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    Temperature,
    Humidity,
    BatteryPercent,
    BatteryMillivolts,
    SequenceCounter,
}

impl MeasurementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "TEMPERATURE",
            MeasurementKind::Humidity => "HUMIDITY",
            MeasurementKind::BatteryPercent => "BATTERY_PERCENT",
            MeasurementKind::BatteryMillivolts => "BATTERY_MILLIVOLTS",
            MeasurementKind::SequenceCounter => "SEQUENCE_COUNTER",
        }
    }

    /// Suffix stored in the `measurement` column, after the configured prefix.
    ///
    /// Battery rows keep the labels the `sensor_data` table already holds
    /// (`MI_BATTERY`, `MI_BATTERY_MV`).
    pub fn label(self) -> &'static str {
        match self {
            MeasurementKind::BatteryPercent => "BATTERY",
            MeasurementKind::BatteryMillivolts => "BATTERY_MV",
            kind => kind.as_str(),
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the measurement table.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow<'a> {
    pub time: OffsetDateTime,
    pub address: MacAddress,
    pub sensor: &'a str,
    /// Label stored in the `measurement` column, e.g. `MI_TEMPERATURE`
    pub measurement: String,
    pub value: f64,
}

/// Transactional destination for measurement rows.
#[async_trait]
pub trait MeasurementSink: Send {
    async fn begin(&mut self) -> Result<(), PersistError>;

    async fn insert(&mut self, row: &MeasurementRow<'_>) -> Result<(), PersistError>;

    async fn commit(&mut self) -> Result<(), PersistError>;

    async fn rollback(&mut self) -> Result<(), PersistError>;
}

/// Expands readings into rows and writes a whole session as one transaction.
///
/// Any failed row rolls back every row of the batch, including rows of other
/// sensors that were already inserted.
#[derive(Debug, Clone)]
pub struct Persister {
    include_extended: bool,
    prefix: String,
}

impl Persister {
    pub fn new(include_extended: bool, prefix: impl Into<String>) -> Self {
        Persister {
            include_extended,
            prefix: prefix.into(),
        }
    }

    /// Values written for one reading. Battery voltage and the frame counter
    /// are only included when extended persistence is on.
    pub fn values(&self, reading: &Reading) -> Vec<(MeasurementKind, f64)> {
        let mut values = vec![
            (MeasurementKind::Temperature, reading.temperature),
            (MeasurementKind::Humidity, f64::from(reading.humidity)),
            (
                MeasurementKind::BatteryPercent,
                f64::from(reading.battery_percent),
            ),
        ];
        if self.include_extended {
            values.push((
                MeasurementKind::BatteryMillivolts,
                f64::from(reading.battery_mv),
            ));
            values.push((MeasurementKind::SequenceCounter, f64::from(reading.counter)));
        }
        values
    }

    /// Write all readings in one transaction.
    ///
    /// # Arguments
    ///
    /// * `sink` - Destination of the rows, left without an open transaction on return
    /// * `readings` - Accepted readings of one scan session
    ///
    /// # Returns
    ///
    /// The number of rows committed. Any failed insert or commit rolls back
    /// the whole batch and returns `BatchRolledBack` or `CommitRolledBack`.
    pub async fn write(
        &self,
        sink: &mut dyn MeasurementSink,
        readings: &[Reading],
    ) -> Result<usize, PersistError> {
        if readings.is_empty() {
            debug!("No readings to write");
            return Ok(0);
        }

        sink.begin().await?;

        let mut rows = 0;
        for reading in readings {
            for (kind, value) in self.values(reading) {
                let row = MeasurementRow {
                    time: reading.captured_at,
                    address: reading.address,
                    sensor: &reading.name,
                    measurement: format!("{}{}", self.prefix, kind.label()),
                    value,
                };

                if let Err(e) = sink.insert(&row).await {
                    rollback(sink).await;
                    return Err(PersistError::BatchRolledBack {
                        address: reading.address,
                        kind,
                        source: Box::new(e),
                    });
                }
                rows += 1;
            }
        }

        if let Err(e) = sink.commit().await {
            rollback(sink).await;
            return Err(PersistError::CommitRolledBack {
                source: Box::new(e),
            });
        }

        info!(
            "Stored {} row(s) for {} sensor(s)",
            rows,
            readings.len()
        );
        Ok(rows)
    }
}

async fn rollback(sink: &mut dyn MeasurementSink) {
    if let Err(e) = sink.rollback().await {
        error!("Rollback failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::decoder::decode_advertisement;
    use crate::test_utils::{advertisement, atc_service_data, CHAMBRE, SALON};
    use time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct StoredRow {
        time: OffsetDateTime,
        address: MacAddress,
        sensor: String,
        measurement: String,
        value: f64,
    }

    /// In-memory sink with transaction semantics.
    #[derive(Default)]
    struct MemorySink {
        pending: Vec<StoredRow>,
        committed: Vec<StoredRow>,
        fail_for: Option<MacAddress>,
        fail_commit: bool,
        begins: usize,
        rollbacks: usize,
    }

    #[async_trait]
    impl MeasurementSink for MemorySink {
        async fn begin(&mut self) -> Result<(), PersistError> {
            self.begins += 1;
            self.pending.clear();
            Ok(())
        }

        async fn insert(&mut self, row: &MeasurementRow<'_>) -> Result<(), PersistError> {
            if self.fail_for == Some(row.address) {
                return Err(PersistError::Sink("value out of range".into()));
            }
            self.pending.push(StoredRow {
                time: row.time,
                address: row.address,
                sensor: row.sensor.to_string(),
                measurement: row.measurement.clone(),
                value: row.value,
            });
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), PersistError> {
            if self.fail_commit {
                return Err(PersistError::Sink("connection lost".into()));
            }
            self.committed.append(&mut self.pending);
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), PersistError> {
            self.rollbacks += 1;
            self.pending.clear();
            Ok(())
        }
    }

    fn readings() -> Vec<Reading> {
        let salon = decode_advertisement(
            &advertisement(SALON, atc_service_data(201, 45, 87, 2950, 4)),
            "Salon",
        )
        .unwrap();
        let mut chambre_adv = advertisement(CHAMBRE, atc_service_data(-12, 60, 55, 2700, 9));
        chambre_adv.observed_at += Duration::seconds(3);
        let chambre = decode_advertisement(&chambre_adv, "Chambre").unwrap();
        vec![salon, chambre]
    }

    #[tokio::test]
    async fn writes_three_rows_per_reading_with_own_timestamps() {
        let readings = readings();
        let mut sink = MemorySink::default();

        let rows = Persister::new(false, "MI_")
            .write(&mut sink, &readings)
            .await
            .unwrap();

        assert_eq!(rows, 6);
        assert_eq!(sink.begins, 1);
        let labels: Vec<_> = sink.committed.iter().map(|r| r.measurement.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "MI_TEMPERATURE",
                "MI_HUMIDITY",
                "MI_BATTERY",
                "MI_TEMPERATURE",
                "MI_HUMIDITY",
                "MI_BATTERY",
            ]
        );
        for row in &sink.committed {
            let reading = readings.iter().find(|r| r.address == row.address).unwrap();
            assert_eq!(row.time, reading.captured_at);
            assert_eq!(row.sensor, reading.name);
        }
        assert_eq!(sink.committed[0].value, 20.1);
        assert_eq!(sink.committed[3].value, -1.2);
        assert_eq!(sink.committed[4].value, 60.0);
    }

    #[tokio::test]
    async fn extended_rows_are_optional() {
        let readings = readings();
        let mut sink = MemorySink::default();

        let rows = Persister::new(true, "")
            .write(&mut sink, &readings[..1])
            .await
            .unwrap();

        assert_eq!(rows, 5);
        assert_eq!(sink.committed[3].measurement, "BATTERY_MV");
        assert_eq!(sink.committed[3].value, 2950.0);
        assert_eq!(sink.committed[4].measurement, "SEQUENCE_COUNTER");
        assert_eq!(sink.committed[4].value, 4.0);
    }

    #[tokio::test]
    async fn default_prefix_matches_existing_labels() {
        let readings = readings();
        let mut sink = MemorySink::default();

        Persister::new(true, crate::config::DEFAULT_MEASUREMENT_PREFIX)
            .write(&mut sink, &readings[..1])
            .await
            .unwrap();

        let labels: Vec<_> = sink.committed.iter().map(|r| r.measurement.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "MI_TEMPERATURE",
                "MI_HUMIDITY",
                "MI_BATTERY",
                "MI_BATTERY_MV",
                "MI_SEQUENCE_COUNTER",
            ]
        );
    }

    #[tokio::test]
    async fn row_failure_rolls_back_the_whole_batch() {
        let readings = readings();
        let mut sink = MemorySink {
            fail_for: Some(CHAMBRE),
            ..Default::default()
        };

        let result = Persister::new(false, "MI_").write(&mut sink, &readings).await;

        match result {
            Err(PersistError::BatchRolledBack { address, kind, .. }) => {
                assert_eq!(address, CHAMBRE);
                assert_eq!(kind, MeasurementKind::Temperature);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(sink.rollbacks, 1);
        assert!(sink.committed.is_empty());
        assert!(sink.pending.is_empty());
    }

    #[tokio::test]
    async fn commit_failure_is_reported() {
        let mut sink = MemorySink {
            fail_commit: true,
            ..Default::default()
        };

        let result = Persister::new(false, "MI_").write(&mut sink, &readings()).await;

        match result {
            Err(PersistError::CommitRolledBack { source }) => {
                assert!(matches!(*source, PersistError::Sink(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(sink.rollbacks, 1);
        assert!(sink.committed.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_not_written() {
        let mut sink = MemorySink::default();
        let rows = Persister::new(false, "MI_").write(&mut sink, &[]).await.unwrap();
        assert_eq!(rows, 0);
        assert_eq!(sink.begins, 0);
    }
}
