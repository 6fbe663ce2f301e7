//! Telemetry relay: drains producer queues into a remote time-series store.
//!
//! Every `(source, field)` pair is an independent series with its own
//! minimum upload interval. Readings arriving inside the interval are
//! dropped, never deferred.
//!
//! A pass takes one reading from each queue, so a producer that enqueues
//! faster than [`RELAY_PERIOD`] builds a backlog and its uploads lag behind
//! real time by the queue length. Most of that backlog is dropped by the
//! throttle without a network call.

pub mod adafruit;

use crate::reading::Reading;
use crate::worker::RunFlag;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pause between drain passes.
pub const RELAY_PERIOD: Duration = Duration::from_secs(1);

/// Backoff after a connection error or timeout.
pub const TRANSIENT_BACKOFF: Duration = Duration::from_secs(5);

/// Backoff after the remote store throttled us.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("request rejected: {0}")]
    Request(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
}

impl ApiError {
    /// How long the relay pauses after this error, `None` for no pause.
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            ApiError::Request(_) => None,
            ApiError::Connection(_) | ApiError::Timeout => Some(TRANSIENT_BACKOFF),
            ApiError::RateLimited => Some(RATE_LIMIT_BACKOFF),
        }
    }
}

/// A remote series as known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub name: String,
    /// Store-assigned identifier used for uploads
    pub key: String,
}

/// Identity of a series on our side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesId {
    pub source: String,
    pub field: &'static str,
}

impl SeriesId {
    pub fn new(source: impl Into<String>, field: &'static str) -> Self {
        Self {
            source: source.into(),
            field,
        }
    }

    /// Remote name, `<source>-<field>`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.source, self.field)
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.field)
    }
}

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Remote telemetry store.
pub trait TelemetryApi: Send + Sync {
    /// Series in `group`; a missing group is created and reported empty.
    fn list_series<'a>(&'a self, group: &'a str) -> ApiFuture<'a, Vec<Series>>;

    fn create_series<'a>(&'a self, name: &'a str, group: &'a str) -> ApiFuture<'a, Series>;

    fn upload<'a>(&'a self, series: &'a Series, value: f64) -> ApiFuture<'a, ()>;
}

/// Outcome of one drain pass, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub uploaded: usize,
    pub dropped: usize,
    pub failed: usize,
}

pub struct TelemetryRelay<A> {
    api: A,
    group: String,
    /// Seconds between uploads to one series
    min_interval: f64,
    queues: Vec<mpsc::UnboundedReceiver<Reading>>,
    series: HashMap<String, Series>,
    last_upload: HashMap<SeriesId, f64>,
    flag: RunFlag,
}

impl<A: TelemetryApi> TelemetryRelay<A> {
    pub fn new(api: A, group: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            api,
            group: group.into(),
            min_interval: min_interval.as_secs_f64(),
            queues: Vec::new(),
            series: HashMap::new(),
            last_upload: HashMap::new(),
            flag: RunFlag::new(),
        }
    }

    pub fn add_queue(&mut self, queue: mpsc::UnboundedReceiver<Reading>) {
        self.queues.push(queue);
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Timestamp of the last successful upload to `id`.
    pub fn last_upload(&self, id: &SeriesId) -> Option<f64> {
        self.last_upload.get(id).copied()
    }

    /// Load the group's existing series. Failure leaves the map empty and
    /// series get created on first use.
    pub async fn provision(&mut self) {
        match self.api.list_series(&self.group).await {
            Ok(series) => {
                info!("{} series in group {}", series.len(), self.group);
                self.series = series.into_iter().map(|s| (s.name.clone(), s)).collect();
            }
            Err(e) => warn!("Failed to query group {}: {e}", self.group),
        }
    }

    /// Pop at most one reading from every queue and upload its fields.
    pub async fn drain_pass(&mut self) -> PassStats {
        let mut stats = PassStats::default();
        for i in 0..self.queues.len() {
            if !self.flag.is_running() {
                break;
            }
            let Ok(reading) = self.queues[i].try_recv() else {
                continue;
            };
            self.relay_reading(i, &reading, &mut stats).await;
        }
        stats
    }

    async fn relay_reading(&mut self, queue: usize, reading: &Reading, stats: &mut PassStats) {
        let timestamp = reading.timestamp();
        for (field, value) in reading.fields() {
            if !self.flag.is_running() {
                return;
            }
            let id = SeriesId::new(reading.source(), field);
            let delta = timestamp - self.last_upload.get(&id).copied().unwrap_or_default();
            if delta <= self.min_interval {
                debug!("Dropping {id} [delta: {delta:.1}] (queue {queue})");
                stats.dropped += 1;
                continue;
            }

            match self.send(&id, value).await {
                Ok(()) => {
                    debug!("Sent {value} to {id} [delta: {delta:.1}]");
                    self.last_upload.insert(id, timestamp);
                    stats.uploaded += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    match e.backoff() {
                        Some(pause) => {
                            warn!("Failed to send {id}: {e}; waiting {}s", pause.as_secs());
                            self.back_off(pause).await;
                        }
                        None => warn!("Failed to send {id}: {e}"),
                    }
                }
            }
        }
    }

    /// Sleep for `pause`, waking every [`RELAY_PERIOD`] to notice a stop.
    async fn back_off(&self, pause: Duration) {
        let deadline = Instant::now() + pause;
        while self.flag.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(RELAY_PERIOD)).await;
        }
    }

    async fn send(&mut self, id: &SeriesId, value: f64) -> Result<(), ApiError> {
        let name = id.name();
        if !self.series.contains_key(&name) {
            let series = self.api.create_series(&name, &self.group).await?;
            info!("Created series {} ({})", series.name, series.key);
            self.series.insert(name.clone(), series);
        }
        match self.series.get(&name) {
            Some(series) => self.api.upload(series, value).await,
            None => Err(ApiError::Request(format!("series {name} not provisioned"))),
        }
    }

    /// Relay worker loop.
    pub async fn run(mut self, flag: RunFlag) {
        self.flag = flag;
        self.provision().await;
        while self.flag.is_running() {
            let stats = self.drain_pass().await;
            if stats != PassStats::default() {
                debug!(
                    "relay pass: {} uploaded, {} dropped, {} failed",
                    stats.uploaded, stats.dropped, stats.failed
                );
            }
            tokio::time::sleep(RELAY_PERIOD).await;
        }
        debug!("relay stopped");
    }
}
