use async_trait::async_trait;
use log::{error, info, warn};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_postgres::{Client, NoTls, Statement};
use url::Url;

use crate::config::DatabaseConfig;
use crate::database::operations::{MeasurementRow, MeasurementSink, PersistError};

const INSERT_MEASUREMENT: &str =
    "INSERT INTO sensor_data (time, mac, capteur, measurement, value) VALUES ($1, $2, $3, $4, $5)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    Disabled,
    /// TLS, verifying the server against `root_cert` when one is given
    Enabled { root_cert: Option<String> },
}

/// A database URL split into what tokio-postgres understands and the TLS setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub url: String,
    pub tls: TlsMode,
}

impl ConnectionTarget {
    /// Strip the libpq-only `sslrootcert` and `sslmode` parameters from the URL.
    pub fn parse(database_url: &str) -> Result<Self, PersistError> {
        let url = Url::parse(database_url).map_err(|e| PersistError::Url(e.to_string()))?;

        let mut root_cert = None;
        let mut ssl_mode = None;
        let mut clean_params = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslrootcert" => root_cert = Some(value.into_owned()),
                "sslmode" => ssl_mode = Some(value.into_owned()),
                _ => clean_params.push((key.into_owned(), value.into_owned())),
            }
        }

        let tls = match ssl_mode.as_deref() {
            Some("disable") => TlsMode::Disabled,
            _ => TlsMode::Enabled { root_cert },
        };

        let mut clean_url = url.clone();
        clean_url.set_query(None);
        if tls != TlsMode::Disabled {
            clean_params.push(("sslmode".to_string(), "require".to_string()));
        }
        if !clean_params.is_empty() {
            clean_url.query_pairs_mut().extend_pairs(&clean_params);
        }

        Ok(ConnectionTarget {
            url: clean_url.to_string(),
            tls,
        })
    }
}

pub fn create_ssl_connector(root_cert: Option<&str>) -> Result<MakeTlsConnector, PersistError> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;

    match root_cert {
        Some(path) => {
            builder.set_ca_file(path)?;
            builder.set_verify(SslVerifyMode::PEER);
        }
        // Encrypt only, as libpq does for sslmode=require without a root certificate
        None => builder.set_verify(SslVerifyMode::NONE),
    }

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Connection to the measurement database.
///
/// The background connection task is aborted when the sink is dropped, so the
/// connection never outlives its owner.
pub struct PgSink {
    client: Client,
    connection: JoinHandle<()>,
    insert: Option<Statement>,
}

impl PgSink {
    pub async fn connect(target: &ConnectionTarget) -> Result<Self, PersistError> {
        let (client, connection) = match &target.tls {
            TlsMode::Enabled { root_cert } => {
                let connector = create_ssl_connector(root_cert.as_deref())?;
                let (client, connection) = tokio_postgres::connect(&target.url, connector).await?;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("Connection error: {}", e);
                    }
                });
                (client, task)
            }
            TlsMode::Disabled => {
                let (client, connection) = tokio_postgres::connect(&target.url, NoTls).await?;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("Connection error: {}", e);
                    }
                });
                (client, task)
            }
        };

        Ok(PgSink {
            client,
            connection,
            insert: None,
        })
    }
}

impl Drop for PgSink {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl MeasurementSink for PgSink {
    async fn begin(&mut self) -> Result<(), PersistError> {
        if self.client.is_closed() {
            return Err(PersistError::Sink("database connection closed".into()));
        }
        if self.insert.is_none() {
            self.insert = Some(self.client.prepare(INSERT_MEASUREMENT).await?);
        }
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn insert(&mut self, row: &MeasurementRow<'_>) -> Result<(), PersistError> {
        let statement = match &self.insert {
            Some(statement) => statement.clone(),
            None => self.client.prepare(INSERT_MEASUREMENT).await?,
        };
        let mac = row.address.to_string();

        self.client
            .execute(
                &statement,
                &[&row.time, &mac, &row.sensor, &row.measurement, &row.value],
            )
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PersistError> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PersistError> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

/// Connect to the database, retrying a bounded number of times.
///
/// An unparsable URL or TLS setup failure is not retried.
///
/// # Arguments
///
/// * `config` - Database URL, attempt count and wait between attempts
///
/// # Returns
///
/// A connected `PgSink`, or `RetriesExhausted` once every attempt failed.
pub async fn connect_with_retry(config: &DatabaseConfig) -> Result<PgSink, PersistError> {
    let target = ConnectionTarget::parse(&config.url)?;
    let attempts = config.max_retries.max(1);

    for attempt in 1..=attempts {
        match PgSink::connect(&target).await {
            Ok(sink) => {
                info!("Connected to database (attempt {})", attempt);
                return Ok(sink);
            }
            Err(e @ PersistError::Tls(_)) => return Err(e),
            Err(e) => warn!("Attempt {}/{}: connection error: {}", attempt, attempts, e),
        }

        if attempt < attempts {
            sleep(config.retry_wait).await;
        }
    }

    Err(PersistError::RetriesExhausted(attempts))
}
