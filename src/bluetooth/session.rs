/// Bounded discovery of the configured sensors
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::time::{Duration, Instant};

use super::decoder::decode_advertisement;
use super::filter::AddressFilter;
use super::scanner::{DiscoveryError, DiscoverySource};
use crate::models::{MacAddress, RawAdvertisement, Reading};
use crate::utils::format_status_line;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Discovery source unavailable: {0}")]
    DiscoverySourceUnavailable(#[source] DiscoveryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    /// Every configured sensor reported
    Complete,
    /// The time budget ran out first; the readings may be partial
    TimedOut,
    /// Shutdown was requested while scanning
    Interrupted,
}

/// Counters for everything a session saw, accepted or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub advertisements: usize,
    pub unknown: usize,
    pub duplicates: usize,
    pub decode_failures: usize,
    pub poll_errors: usize,
}

/// Result of a finished session. Readings are in discovery order.
#[derive(Debug)]
pub struct ScanOutcome {
    pub state: ScanState,
    pub readings: Vec<Reading>,
    pub stats: ScanStats,
}

/// One scan cycle over a fixed set of known sensors.
///
/// The first successfully decoded advertisement of each address is kept;
/// later ones in the same session are ignored.
pub struct ScanSession<'a> {
    filter: &'a AddressFilter,
    poll_interval: Duration,
    state: ScanState,
    target_count: usize,
    deadline: Option<Instant>,
    discovered: HashMap<MacAddress, Reading>,
    order: Vec<MacAddress>,
    stats: ScanStats,
}

impl<'a> ScanSession<'a> {
    pub fn new(filter: &'a AddressFilter, poll_interval: Duration) -> Self {
        ScanSession {
            filter,
            poll_interval,
            state: ScanState::Idle,
            target_count: 0,
            deadline: None,
            discovered: HashMap::new(),
            order: Vec::new(),
            stats: ScanStats::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.discovered.len() == self.target_count
    }

    /// Enter `Scanning` with a deadline `max_duration` from now.
    pub fn start(&mut self, max_duration: Duration) {
        self.target_count = self.filter.len();
        self.deadline = Some(Instant::now() + max_duration);
        self.state = ScanState::Scanning;
    }

    /// Process one batch of advertisements and return the addresses that got
    /// their reading from this batch.
    pub fn ingest(&mut self, batch: Vec<RawAdvertisement>) -> Vec<MacAddress> {
        let mut accepted = Vec::new();

        for adv in batch {
            self.stats.advertisements += 1;

            if !self.filter.contains(&adv.address) {
                self.stats.unknown += 1;
                continue;
            }
            if self.discovered.contains_key(&adv.address) {
                self.stats.duplicates += 1;
                continue;
            }

            let name = self.filter.name_for(&adv.address).unwrap_or_default();
            match decode_advertisement(&adv, name) {
                Ok(reading) => {
                    self.discovered.insert(adv.address, reading);
                    self.order.push(adv.address);
                    accepted.push(adv.address);
                }
                Err(e) => {
                    self.stats.decode_failures += 1;
                    debug!("Skipping advertisement from {}: {}", adv.address, e);
                }
            }
        }

        accepted
    }

    pub fn reading(&self, address: &MacAddress) -> Option<&Reading> {
        self.discovered.get(address)
    }

    /// Poll `source` until every known sensor reported, the time budget is
    /// spent, or `shutdown` resolves.
    ///
    /// Only a failure to start the source is an error. The source is stopped
    /// on every other path.
    ///
    /// # Arguments
    ///
    /// * `source` - Discovery source, started and stopped by this call
    /// * `max_duration` - Time budget of the whole scan
    /// * `shutdown` - Future that interrupts the scan when it resolves
    ///
    /// # Returns
    ///
    /// The final state with the accepted readings in first-seen order, or
    /// `DiscoverySourceUnavailable` if the source could not start.
    pub async fn run<F>(
        mut self,
        source: &mut dyn DiscoverySource,
        max_duration: Duration,
        shutdown: F,
    ) -> Result<ScanOutcome, ScanError>
    where
        F: Future<Output = ()>,
    {
        source
            .start()
            .await
            .map_err(ScanError::DiscoverySourceUnavailable)?;

        self.start(max_duration);
        if self.filter.is_empty() {
            warn!("No sensors configured, nothing to scan for");
        }
        info!(
            "Scanning for {} sensor(s), up to {:?}",
            self.target_count, max_duration
        );

        tokio::pin!(shutdown);
        self.scan_loop(source, &mut shutdown).await;

        if let Err(e) = source.stop().await {
            warn!("Failed to stop discovery: {}", e);
        }

        Ok(self.finish())
    }

    async fn scan_loop<F>(&mut self, source: &mut dyn DiscoverySource, shutdown: &mut F)
    where
        F: Future<Output = ()> + Unpin,
    {
        let deadline = self.deadline.unwrap_or_else(Instant::now);

        loop {
            if self.is_complete() {
                self.state = ScanState::Complete;
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                self.state = ScanState::TimedOut;
                return;
            }
            let slice = self.poll_interval.min(deadline - now);

            let batch = tokio::select! {
                batch = source.poll_slice(slice) => batch,
                _ = &mut *shutdown => {
                    self.state = ScanState::Interrupted;
                    return;
                }
            };

            match batch {
                Ok(batch) => {
                    for address in self.ingest(batch) {
                        if let Some(reading) = self.reading(&address) {
                            println!("{}", format_status_line(reading));
                        }
                    }
                }
                Err(e) => {
                    self.stats.poll_errors += 1;
                    error!("Discovery poll failed: {}", e);
                    // Don't spin on a source that fails immediately
                    tokio::time::sleep(slice).await;
                }
            }
        }
    }

    fn finish(mut self) -> ScanOutcome {
        let readings = self
            .order
            .iter()
            .filter_map(|address| self.discovered.remove(address))
            .collect();

        ScanOutcome {
            state: self.state,
            readings,
            stats: self.stats,
        }
    }
}
