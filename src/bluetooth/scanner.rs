/// Bluetooth Low Energy discovery sources
///
/// The scan session only sees the [`DiscoverySource`] trait. The BlueZ
/// implementation below supports an active discovery session and a passive
/// advertisement monitor, chosen at runtime through [`Backend`].
use async_trait::async_trait;
use bluer::monitor::{Monitor, MonitorEvent, MonitorManager, Pattern};
use bluer::{Adapter, AdapterEvent, Address, Session, Uuid};
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::{timeout_at, Duration, Instant};

use super::decoder::ATC_SERVICE_TAG;
use crate::models::RawAdvertisement;

// Environmental Sensing service, where ATC firmware puts its service data
const ENVIRONMENTAL_SENSING_UUID: Uuid = Uuid::from_u128(0x0000181a_0000_1000_8000_00805f9b34fb);
// AD type "Service Data - 16-bit UUID"
const SERVICE_DATA_16_TYPE: u8 = 0x16;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error("discovery source not started")]
    NotStarted,
    #[error("discovery event stream ended")]
    StreamEnded,
}

/// A radio stack that reports advertisements in bounded slices.
#[async_trait]
pub trait DiscoverySource: Send {
    async fn start(&mut self) -> Result<(), DiscoveryError>;

    async fn stop(&mut self) -> Result<(), DiscoveryError>;

    /// Collect the advertisements reported within `timeout`.
    async fn poll_slice(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<RawAdvertisement>, DiscoveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// BlueZ discovery session (active scanning)
    #[default]
    Active,
    /// BlueZ advertisement monitor (passive scanning, needs bluetoothd --experimental)
    Passive,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Active => write!(f, "active"),
            Backend::Passive => write!(f, "passive"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" | "discovery" => Ok(Backend::Active),
            "passive" | "monitor" => Ok(Backend::Passive),
            _ => Err(format!("Unknown scan backend: {}", s)),
        }
    }
}

pub fn open_source(backend: Backend) -> Box<dyn DiscoverySource> {
    Box::new(BluerSource::new(backend))
}

/// Discovery source backed by BlueZ through `bluer`.
///
/// Everything acquired in `start` is dropped in `stop`, and also when the
/// source itself is dropped.
pub struct BluerSource {
    backend: Backend,
    session: Option<Session>,
    adapter: Option<Adapter>,
    monitor: Option<MonitorManager>,
    events: Option<BoxStream<'static, Address>>,
}

impl BluerSource {
    pub fn new(backend: Backend) -> Self {
        BluerSource {
            backend,
            session: None,
            adapter: None,
            monitor: None,
            events: None,
        }
    }

    async fn start_discovery(adapter: &Adapter) -> Result<BoxStream<'static, Address>, DiscoveryError> {
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: true, // Report every advertisement, not only the first
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let stream = adapter.discover_devices_with_changes().await?;
        Ok(stream
            .filter_map(|event| async move {
                match event {
                    AdapterEvent::DeviceAdded(address) => Some(address),
                    _ => None,
                }
            })
            .boxed())
    }

    async fn start_monitor(
        adapter: &Adapter,
    ) -> Result<(MonitorManager, BoxStream<'static, Address>), DiscoveryError> {
        let pattern = Pattern {
            data_type: SERVICE_DATA_16_TYPE,
            start_position: 0,
            content: ATC_SERVICE_TAG.to_vec(),
        };

        let manager = adapter.monitor().await?;
        let handle = manager
            .register(Monitor {
                patterns: Some(vec![pattern]),
                ..Default::default()
            })
            .await?;

        let stream = handle
            .filter_map(|event| async move {
                match event {
                    MonitorEvent::DeviceFound(id) => Some(id.device),
                    _ => None,
                }
            })
            .boxed();
        Ok((manager, stream))
    }
}

#[async_trait]
impl DiscoverySource for BluerSource {
    async fn start(&mut self) -> Result<(), DiscoveryError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let events = match self.backend {
            Backend::Active => Self::start_discovery(&adapter).await?,
            Backend::Passive => {
                let (manager, events) = Self::start_monitor(&adapter).await?;
                self.monitor = Some(manager);
                events
            }
        };
        info!(
            "Scanning on adapter {} ({} backend)",
            adapter.name(),
            self.backend
        );

        self.events = Some(events);
        self.adapter = Some(adapter);
        self.session = Some(session);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DiscoveryError> {
        // Dropping the stream ends the discovery session or unregisters the monitor
        self.events = None;
        self.monitor = None;
        self.adapter = None;
        self.session = None;
        debug!("Discovery stopped");
        Ok(())
    }

    async fn poll_slice(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<RawAdvertisement>, DiscoveryError> {
        let (Some(adapter), Some(events)) = (self.adapter.as_ref(), self.events.as_mut()) else {
            return Err(DiscoveryError::NotStarted);
        };

        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();
        // A busy stream is always ready, so check the deadline ourselves too
        while Instant::now() < deadline {
            match timeout_at(deadline, events.next()).await {
                Ok(Some(address)) => {
                    if let Some(adv) = read_advertisement(adapter, address).await {
                        batch.push(adv);
                    }
                }
                Ok(None) => return Err(DiscoveryError::StreamEnded),
                Err(_) => break,
            }
        }

        Ok(batch)
    }
}

/// Read the Environmental Sensing service data and RSSI of a reported device.
///
/// Devices without that service data are not ATC sensors and yield `None`.
async fn read_advertisement(adapter: &Adapter, address: Address) -> Option<RawAdvertisement> {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            debug!("Failed to open device {}: {}", address, e);
            return None;
        }
    };

    let rssi = device.rssi().await.unwrap_or_else(|e| {
        debug!("Failed to get RSSI for {}: {}", address, e);
        None
    });

    let payload = match device.service_data().await {
        Ok(Some(mut service_data)) => service_data.remove(&ENVIRONMENTAL_SENSING_UUID)?,
        Ok(None) => return None,
        Err(e) => {
            debug!("Failed to get service data for {}: {}", address, e);
            return None;
        }
    };

    let adv = live_advertisement(address, rssi, &payload, OffsetDateTime::now_utc());
    if adv.is_none() {
        debug!("Skipping cached properties of {} (no RSSI, out of range)", address);
    }
    adv
}

/// Build an advertisement from device properties read off BlueZ.
///
/// BlueZ keeps the last service data of a device after it goes out of range
/// but clears its RSSI, so properties without an RSSI are stale and yield `None`.
fn live_advertisement(
    address: Address,
    rssi: Option<i16>,
    payload: &[u8],
    observed_at: OffsetDateTime,
) -> Option<RawAdvertisement> {
    let rssi = rssi?;

    let mut service_data = Vec::with_capacity(ATC_SERVICE_TAG.len() + payload.len());
    service_data.extend_from_slice(&ATC_SERVICE_TAG);
    service_data.extend_from_slice(payload);

    Some(RawAdvertisement {
        address: address.into(),
        service_data,
        rssi: Some(rssi),
        observed_at,
    })
}
