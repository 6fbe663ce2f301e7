//! One-wire temperature sensors with self-calibrating poll cadence.
//!
//! A [`SensorChannel`] wraps a [`SensorDevice`], converts its raw value to
//! degrees Fahrenheit and measures how long the gaps between its polls are.
//! The median of the first few gaps becomes the channel's [`interval`], which
//! the thermostat uses as its mode evaluation period.
//!
//! [`interval`]: SensorChannel::interval

use crate::hardware::HardwareError;
use crate::reading::{Reading, utc_now};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where the kernel exposes one-wire bus masters.
pub const DEFAULT_W1_ROOT: &str = "/sys/bus/w1/devices";

/// Number of poll gaps sampled before the interval is frozen.
pub const INTERVAL_SAMPLES: usize = 5;

/// Family code prefix of DS18B20 probes.
const DS18B20_PREFIX: &str = "28-";

/// Convert a one-wire raw value (thousandths of a degree Celsius) to Fahrenheit.
#[inline]
pub fn millicelsius_to_fahrenheit(raw: f64) -> f64 {
    raw * 9.0 / 5000.0 + 32.0
}

/// A temperature source.
pub trait SensorDevice: Send {
    /// Latest raw value, `None` if the device produced nothing this time.
    fn read_latest(&mut self) -> Result<Option<f64>, HardwareError>;
}

/// Single DS18B20 probe on a dedicated one-wire bus master.
#[derive(Debug)]
pub struct OneWireSensor {
    root: PathBuf,
    bus: String,
    path: Option<PathBuf>,
}

impl OneWireSensor {
    pub fn new(root: impl Into<PathBuf>, bus: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bus: bus.into(),
            path: None,
        }
    }

    fn discover(&self) -> Option<PathBuf> {
        let mut probes: Vec<PathBuf> = fs::read_dir(self.root.join(&self.bus))
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(DS18B20_PREFIX))
            .map(|entry| entry.path().join("temperature"))
            .collect();
        probes.sort();
        probes.into_iter().next()
    }
}

impl SensorDevice for OneWireSensor {
    fn read_latest(&mut self) -> Result<Option<f64>, HardwareError> {
        if self.path.is_none() {
            self.path = self.discover();
        }
        let Some(path) = self.path.as_deref() else {
            return Err(HardwareError::Absent(format!(
                "no temp sensor found on bus {}",
                self.bus
            )));
        };

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                self.path = None;
                return Err(HardwareError::Absent(format!(
                    "temp sensor removed on bus {}: {e}",
                    self.bus
                )));
            }
        };

        let Some(line) = contents.lines().map(str::trim).filter(|l| !l.is_empty()).last() else {
            return Ok(None);
        };
        line.parse()
            .map(Some)
            .map_err(|_| HardwareError::Transient(format!("bad value {line:?} on bus {}", self.bus)))
    }
}

/// Latest state published by a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorStatus {
    /// Last temperature in Fahrenheit, `None` while the device is missing
    pub last: Option<f64>,
    /// Self-calibrated poll interval
    pub interval: Option<Duration>,
}

/// Read-only view of a channel for other workers.
#[derive(Debug, Clone)]
pub struct SensorHandle(watch::Receiver<SensorStatus>);

impl SensorHandle {
    pub fn latest(&self) -> Option<f64> {
        self.0.borrow().last
    }

    pub fn interval(&self) -> Option<Duration> {
        self.0.borrow().interval
    }
}

impl From<watch::Receiver<SensorStatus>> for SensorHandle {
    fn from(rx: watch::Receiver<SensorStatus>) -> Self {
        Self(rx)
    }
}

/// A named temperature source polled by the orchestrator.
pub struct SensorChannel {
    name: String,
    device: Box<dyn SensorDevice>,
    last_temp: Option<f64>,
    last_poll: Option<Instant>,
    gaps: Vec<Duration>,
    missing: bool,
    queue: Option<mpsc::UnboundedSender<Reading>>,
    status: watch::Sender<SensorStatus>,
}

impl SensorChannel {
    pub fn new(name: impl Into<String>, device: Box<dyn SensorDevice>) -> Self {
        let (status, _) = watch::channel(SensorStatus::default());
        Self {
            name: name.into(),
            device,
            last_temp: None,
            last_poll: None,
            gaps: Vec::with_capacity(INTERVAL_SAMPLES),
            missing: false,
            queue: None,
            status,
        }
    }

    /// Enqueue every successful reading on `queue`.
    pub fn with_queue(mut self, queue: mpsc::UnboundedSender<Reading>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> SensorHandle {
        SensorHandle(self.status.subscribe())
    }

    pub fn last(&self) -> Option<f64> {
        self.last_temp
    }

    /// Median of the recorded poll gaps.
    ///
    /// `None` until two polls have happened; fixed once
    /// [`INTERVAL_SAMPLES`] gaps have been recorded.
    pub fn interval(&self) -> Option<Duration> {
        median(&self.gaps)
    }

    pub fn poll(&mut self) -> Option<Reading> {
        self.poll_at(Instant::now(), utc_now())
    }

    /// Poll the device as if at monotonic time `now` and wall time `timestamp`.
    pub fn poll_at(&mut self, now: Instant, timestamp: f64) -> Option<Reading> {
        if let Some(previous) = self.last_poll
            && self.gaps.len() < INTERVAL_SAMPLES
        {
            self.gaps.push(now.saturating_duration_since(previous));
        }
        self.last_poll = Some(now);

        let reading = match self.device.read_latest() {
            Ok(Some(raw)) => {
                let temp = millicelsius_to_fahrenheit(raw);
                if self.missing {
                    info!(sensor = %self.name, "temp sensor back online");
                    self.missing = false;
                }
                debug!(sensor = %self.name, temp, "read temp");
                self.last_temp = Some(temp);
                Some(Reading::Temperature {
                    source: self.name.clone(),
                    timestamp,
                    temp,
                })
            }
            Ok(None) => None,
            Err(HardwareError::Absent(msg)) => {
                if !self.missing {
                    warn!(sensor = %self.name, "{msg}");
                    self.missing = true;
                }
                self.last_temp = None;
                None
            }
            Err(HardwareError::Transient(msg)) => {
                warn!(sensor = %self.name, "read failure: {msg}");
                None
            }
        };

        if let (Some(reading), Some(queue)) = (&reading, &self.queue) {
            // A closed queue means nobody reports this channel.
            let _ = queue.send(reading.clone());
        }

        self.status.send_replace(SensorStatus {
            last: self.last_temp,
            interval: self.interval(),
        });
        reading
    }
}

fn median(samples: &[Duration]) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeSensor, scratch_dir};

    #[test]
    fn test_conversion_to_fahrenheit() {
        assert!((millicelsius_to_fahrenheit(21563.0) - 70.8134).abs() < 1e-9);
        assert_eq!(millicelsius_to_fahrenheit(0.0), 32.0);
        assert_eq!(millicelsius_to_fahrenheit(100_000.0), 212.0);
    }

    #[test]
    fn test_interval_none_before_second_poll() {
        let mut channel = SensorChannel::new("t", Box::new(FakeSensor::constant(20000.0)));
        assert_eq!(channel.interval(), None);
        channel.poll_at(Instant::now(), 0.0);
        assert_eq!(channel.interval(), None);
    }

    #[test]
    fn test_interval_is_running_median_then_frozen() {
        let mut channel = SensorChannel::new("t", Box::new(FakeSensor::constant(20000.0)));
        let start = Instant::now();
        let gaps_ms = [800u64, 1200, 1000, 900, 5000, 10, 10, 10];
        let mut now = start;
        channel.poll_at(now, 0.0);

        now += Duration::from_millis(gaps_ms[0]);
        channel.poll_at(now, 0.0);
        assert_eq!(channel.interval(), Some(Duration::from_millis(800)));

        now += Duration::from_millis(gaps_ms[1]);
        channel.poll_at(now, 0.0);
        assert_eq!(channel.interval(), Some(Duration::from_millis(1000)));

        for gap in &gaps_ms[2..] {
            now += Duration::from_millis(*gap);
            channel.poll_at(now, 0.0);
        }
        // median of 800, 1200, 1000, 900, 5000
        assert_eq!(channel.interval(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_missing_device_degrades_to_no_reading() {
        let mut channel = SensorChannel::new("t", Box::new(FakeSensor::absent()));
        assert!(channel.poll().is_none());
        assert_eq!(channel.last(), None);
    }

    #[test]
    fn test_removed_device_clears_last_value() {
        let sensor = FakeSensor::scripted(vec![
            Ok(Some(21563.0)),
            Err(HardwareError::Absent("gone".to_string())),
        ]);
        let mut channel = SensorChannel::new("t", Box::new(sensor));
        assert!(channel.poll().is_some());
        assert!(channel.last().is_some());
        assert!(channel.poll().is_none());
        assert_eq!(channel.last(), None);
    }

    #[test]
    fn test_transient_fault_keeps_last_value() {
        let sensor = FakeSensor::scripted(vec![
            Ok(Some(21563.0)),
            Err(HardwareError::Transient("crc".to_string())),
        ]);
        let mut channel = SensorChannel::new("t", Box::new(sensor));
        channel.poll();
        assert!(channel.poll().is_none());
        assert!(channel.last().is_some());
    }

    #[test]
    fn test_reading_is_enqueued_and_published() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel =
            SensorChannel::new("ambient", Box::new(FakeSensor::constant(21563.0))).with_queue(tx);
        let handle = channel.handle();

        channel.poll_at(Instant::now(), 42.0);

        match rx.try_recv().unwrap() {
            Reading::Temperature {
                source,
                timestamp,
                temp,
            } => {
                assert_eq!(source, "ambient");
                assert_eq!(timestamp, 42.0);
                assert!((temp - 70.8134).abs() < 1e-6);
            }
            other => panic!("unexpected reading {other:?}"),
        }
        assert_eq!(handle.latest(), channel.last());
    }

    #[test]
    fn test_one_wire_reads_sysfs_layout() {
        let root = scratch_dir("w1-read");
        let probe = root.join("w1_bus_master1").join("28-0000075a1b2c");
        fs::create_dir_all(&probe).unwrap();
        fs::write(probe.join("temperature"), "21563\n").unwrap();

        let mut sensor = OneWireSensor::new(&root, "w1_bus_master1");
        assert_eq!(sensor.read_latest().unwrap(), Some(21563.0));

        fs::remove_dir_all(&probe).unwrap();
        assert!(matches!(sensor.read_latest(), Err(HardwareError::Absent(_))));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_one_wire_missing_bus_is_absent() {
        let root = scratch_dir("w1-missing");
        let mut sensor = OneWireSensor::new(&root, "w1_bus_master9");
        assert!(matches!(sensor.read_latest(), Err(HardwareError::Absent(_))));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_one_wire_empty_file_is_no_value() {
        let root = scratch_dir("w1-empty");
        let probe = root.join("w1_bus_master1").join("28-0000075a1b2c");
        fs::create_dir_all(&probe).unwrap();
        fs::write(probe.join("temperature"), "").unwrap();

        let mut sensor = OneWireSensor::new(&root, "w1_bus_master1");
        assert_eq!(sensor.read_latest().unwrap(), None);
        fs::remove_dir_all(&root).unwrap();
    }
}
