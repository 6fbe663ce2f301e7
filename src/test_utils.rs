//! Shared fakes for unit tests.
//!
//! Every fake is cheaply cloneable and shares its state between clones, so a
//! test can hand one copy to the code under test and inspect the other.

use crate::beacon::BeaconColor;
use crate::hardware::{Actuator, CharacterDisplay, HardwareError, Rgb, RotaryInput};
use crate::reading::Reading;
use crate::relay::{ApiError, ApiFuture, Series, TelemetryApi};
use crate::sensor::SensorDevice;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// A fresh, empty directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "tilt-relay-{name}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Full manufacturer data of a Tilt advertisement, company id included.
pub fn tilt_payload(color: BeaconColor, temp: u16, gravity: u16, tx: u8) -> Vec<u8> {
    let mut payload = vec![0x4C, 0x00, 0x02, 0x15];
    payload.extend_from_slice(&color.uuid());
    payload.extend_from_slice(&temp.to_be_bytes());
    payload.extend_from_slice(&gravity.to_be_bytes());
    payload.push(tx);
    payload
}

pub fn temperature(source: &str, timestamp: f64, temp: f64) -> Reading {
    Reading::Temperature {
        source: source.to_string(),
        timestamp,
        temp,
    }
}

/// Sensor returning a fixed value or a scripted sequence of results.
pub struct FakeSensor {
    script: VecDeque<Result<Option<f64>, HardwareError>>,
    fallback: Result<Option<f64>, HardwareError>,
}

impl FakeSensor {
    /// Always reads `raw` thousandths of a degree.
    pub fn constant(raw: f64) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Ok(Some(raw)),
        }
    }

    pub fn absent() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Err(HardwareError::Absent("no probe".to_string())),
        }
    }

    /// Returns `results` in order, then no value.
    pub fn scripted(results: Vec<Result<Option<f64>, HardwareError>>) -> Self {
        Self {
            script: results.into(),
            fallback: Ok(None),
        }
    }
}

impl SensorDevice for FakeSensor {
    fn read_latest(&mut self) -> Result<Option<f64>, HardwareError> {
        self.script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeDisplay {
    writes: Arc<Mutex<Vec<(usize, String)>>>,
}

impl FakeDisplay {
    pub fn writes(&self) -> Vec<(usize, String)> {
        self.writes.lock().unwrap().clone()
    }

    /// Most recent text written to `row`.
    pub fn row(&self, row: usize) -> Option<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(r, _)| *r == row)
            .map(|(_, text)| text.clone())
    }
}

impl CharacterDisplay for FakeDisplay {
    fn write_line(&mut self, row: usize, text: &str) -> Result<(), HardwareError> {
        self.writes.lock().unwrap().push((row, text.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeActuator {
    levels: Arc<Mutex<HashMap<u8, bool>>>,
    history: Arc<Mutex<Vec<(u8, bool)>>>,
}

impl FakeActuator {
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels.lock().unwrap().get(&pin).copied()
    }

    /// Every write in order.
    pub fn history(&self) -> Vec<(u8, bool)> {
        self.history.lock().unwrap().clone()
    }
}

impl Actuator for FakeActuator {
    fn set_output(&mut self, pin: u8, on: bool) -> Result<(), HardwareError> {
        self.levels.lock().unwrap().insert(pin, on);
        self.history.lock().unwrap().push((pin, on));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RotaryState {
    position: i32,
    pressed: bool,
    faulty: bool,
    indicator: Option<Rgb>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeRotary {
    state: Arc<Mutex<RotaryState>>,
}

impl FakeRotary {
    pub fn set_position(&self, position: i32) {
        self.state.lock().unwrap().position = position;
    }

    pub fn set_pressed(&self, pressed: bool) {
        self.state.lock().unwrap().pressed = pressed;
    }

    /// Make every read fail until cleared.
    pub fn set_faulty(&self, faulty: bool) {
        self.state.lock().unwrap().faulty = faulty;
    }

    pub fn indicator(&self) -> Option<Rgb> {
        self.state.lock().unwrap().indicator
    }
}

impl RotaryInput for FakeRotary {
    fn position(&mut self) -> Result<i32, HardwareError> {
        let state = self.state.lock().unwrap();
        if state.faulty {
            return Err(HardwareError::Transient("i2c read".to_string()));
        }
        Ok(state.position)
    }

    fn pressed(&mut self) -> Result<bool, HardwareError> {
        let state = self.state.lock().unwrap();
        if state.faulty {
            return Err(HardwareError::Transient("i2c read".to_string()));
        }
        Ok(state.pressed)
    }

    fn set_indicator(&mut self, color: Rgb) -> Result<(), HardwareError> {
        self.state.lock().unwrap().indicator = Some(color);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ApiState {
    series: Vec<Series>,
    created: Vec<String>,
    uploads: Vec<(String, f64)>,
    attempts: Vec<Instant>,
    failures: VecDeque<ApiError>,
}

/// In-memory telemetry store. Queued failures are returned by the next calls.
#[derive(Debug, Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<ApiState>>,
}

impl FakeApi {
    pub fn with_series(names: &[&str]) -> Self {
        let api = Self::default();
        api.state.lock().unwrap().series = names
            .iter()
            .map(|name| Series {
                name: name.to_string(),
                key: format!("garage.{}", name.to_lowercase()),
            })
            .collect();
        api
    }

    pub fn fail_next(&self, error: ApiError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    /// Names of series created through the API.
    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    /// `(series name, value)` of every successful upload.
    pub fn uploads(&self) -> Vec<(String, f64)> {
        self.state.lock().unwrap().uploads.clone()
    }

    /// Clock time of every call.
    pub fn attempts(&self) -> Vec<Instant> {
        self.state.lock().unwrap().attempts.clone()
    }

    fn call(&self) -> Result<std::sync::MutexGuard<'_, ApiState>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(Instant::now());
        match state.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }
}

impl TelemetryApi for FakeApi {
    fn list_series<'a>(&'a self, _group: &'a str) -> ApiFuture<'a, Vec<Series>> {
        let result = self.call().map(|state| state.series.clone());
        Box::pin(async move { result })
    }

    fn create_series<'a>(&'a self, name: &'a str, group: &'a str) -> ApiFuture<'a, Series> {
        let result = self.call().map(|mut state| {
            let series = Series {
                name: name.to_string(),
                key: format!("{group}.{}", name.to_lowercase()),
            };
            state.series.push(series.clone());
            state.created.push(name.to_string());
            series
        });
        Box::pin(async move { result })
    }

    fn upload<'a>(&'a self, series: &'a Series, value: f64) -> ApiFuture<'a, ()> {
        let result = self.call().map(|mut state| {
            state.uploads.push((series.name.clone(), value));
        });
        Box::pin(async move { result })
    }
}
