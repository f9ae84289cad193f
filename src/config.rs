use log::{debug, info, warn};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;
use tokio::time::Duration;

use crate::bluetooth::Backend;
use crate::models::{MacAddress, SensorIdentity};

const DEFAULT_SCAN_DURATION_SECS: u64 = 30;
const DEFAULT_POLL_MS: u64 = 2000;
pub(crate) const DEFAULT_MEASUREMENT_PREFIX: &str = "MI_";
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_RETRY_WAIT_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No sensors configured. Please set ATC_SENSORS or ATC_SENSOR_<N>_MAC/ATC_SENSOR_<N>_NAME environment variables")]
    NoSensors,
    #[error("Invalid sensor entry '{0}': expected MAC=Name")]
    InvalidSensor(String),
    #[error(transparent)]
    InvalidAddress(#[from] crate::models::ParseMacError),
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_retries: usize,
    pub retry_wait: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub sensors: Vec<SensorIdentity>,
    pub database: Option<DatabaseConfig>,
    pub scan_duration: Duration,
    pub poll_interval: Duration,
    pub backend: Backend,
    pub persist_extended: bool,
    pub measurement_prefix: String,
}

impl SensorConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_vars(env::vars())
    }

    /// Build the configuration from `(name, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let sensors = parse_sensors(&vars)?;
        if sensors.is_empty() {
            return Err(ConfigError::NoSensors);
        }
        info!("Total sensors loaded: {}", sensors.len());
        for sensor in &sensors {
            debug!("Sensor: {} -> {}", sensor.address, sensor.name);
        }

        let database = match vars.get("DATABASE_URL").filter(|url| !url.trim().is_empty()) {
            Some(url) => Some(DatabaseConfig {
                url: url.trim().to_string(),
                max_retries: parse_or(&vars, "DATABASE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?.max(1),
                retry_wait: Duration::from_secs(parse_or(
                    &vars,
                    "DATABASE_RETRY_WAIT_SECS",
                    DEFAULT_RETRY_WAIT_SECS,
                )?),
            }),
            None => None,
        };

        let poll_ms: u64 = parse_or(&vars, "SCAN_POLL_MS", DEFAULT_POLL_MS)?;
        if poll_ms == 0 {
            return Err(invalid("SCAN_POLL_MS", "0", "must be positive"));
        }

        Ok(SensorConfig {
            sensors,
            database,
            scan_duration: Duration::from_secs(parse_or(
                &vars,
                "SCAN_DURATION_SECS",
                DEFAULT_SCAN_DURATION_SECS,
            )?),
            poll_interval: Duration::from_millis(poll_ms),
            backend: parse_or(&vars, "SCAN_BACKEND", Backend::default())?,
            persist_extended: parse_flag(&vars, "PERSIST_EXTENDED")?,
            measurement_prefix: vars
                .get("MEASUREMENT_PREFIX")
                .cloned()
                .unwrap_or_else(|| DEFAULT_MEASUREMENT_PREFIX.to_string()),
        })
    }
}

fn parse_sensors(vars: &HashMap<String, String>) -> Result<Vec<SensorIdentity>, ConfigError> {
    let mut sensors: Vec<SensorIdentity> = Vec::new();
    let mut push = |address: MacAddress, name: &str| {
        if sensors.iter().any(|s| s.address == address) {
            warn!("Sensor {} configured twice, keeping the first name", address);
        } else {
            sensors.push(SensorIdentity {
                address,
                name: name.to_string(),
            });
        }
    };

    // Try ATC_SENSORS format first
    if let Some(list) = vars.get("ATC_SENSORS") {
        for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((mac, name)) = pair.split_once('=') else {
                return Err(ConfigError::InvalidSensor(pair.to_string()));
            };
            let (mac, name) = (mac.trim(), name.trim());
            if mac.is_empty() || name.is_empty() {
                return Err(ConfigError::InvalidSensor(pair.to_string()));
            }
            push(mac.parse()?, name);
        }
        return Ok(sensors);
    }

    // Fallback to individual environment variables, in index order
    let mut indexed: Vec<(&str, &String)> = vars
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix("ATC_SENSOR_")
                .and_then(|s| s.strip_suffix("_MAC"))
                .map(|index| (index, value))
        })
        .collect();
    indexed.sort_by(|a, b| natural_index(a.0).cmp(&natural_index(b.0)));

    for (index, mac) in indexed {
        let name_key = format!("ATC_SENSOR_{}_NAME", index);
        match vars.get(&name_key) {
            Some(name) => push(mac.parse()?, name.trim()),
            None => warn!("{} is missing, skipping ATC_SENSOR_{}_MAC", name_key, index),
        }
    }

    Ok(sensors)
}

fn natural_index(index: &str) -> (u64, &str) {
    (index.parse().unwrap_or(u64::MAX), index)
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match vars.get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, value, &e.to_string())),
        None => Ok(default),
    }
}

fn parse_flag(vars: &HashMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    match vars.get(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(invalid(key, &v, "expected true or false")),
        },
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
