//! Readings flowing from producers (sensors, beacons, controllers) to the relay.

use crate::beacon::BeaconRecord;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in UTC seconds since the Unix epoch.
pub fn utc_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Controller heartbeat emitted on every mode evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub source: String,
    pub timestamp: f64,
    pub setpoint: f64,
    pub window: f64,
    /// Heat output drive in percent (0 or 100)
    pub heat: u8,
    /// Cool output drive in percent (0 or 100)
    pub cool: u8,
}

/// A single immutable reading.
///
/// Each variant carries a fixed field set; [`Reading::fields`] lists the
/// values that become telemetry series, the source name and timestamp are
/// identifying and never uploaded.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// One-wire probe temperature in degrees Fahrenheit
    Temperature {
        source: String,
        timestamp: f64,
        temp: f64,
    },
    /// Decoded Tilt hydrometer advertisement
    Beacon(BeaconRecord),
    /// Thermostat mode evaluation
    Heartbeat(Heartbeat),
}

impl Reading {
    pub fn source(&self) -> &str {
        match self {
            Reading::Temperature { source, .. } => source,
            Reading::Beacon(record) => record.color.source_name(),
            Reading::Heartbeat(heartbeat) => &heartbeat.source,
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            Reading::Temperature { timestamp, .. } => *timestamp,
            Reading::Beacon(record) => record.timestamp,
            Reading::Heartbeat(heartbeat) => heartbeat.timestamp,
        }
    }

    /// Non-identifying `(field, value)` pairs, in upload order.
    pub fn fields(&self) -> Vec<(&'static str, f64)> {
        match self {
            Reading::Temperature { temp, .. } => vec![("temp", *temp)],
            Reading::Beacon(record) => vec![
                ("temp", f64::from(record.temp_raw)),
                ("sg", record.specific_gravity),
                ("tx", f64::from(record.tx_power)),
                ("rssi", f64::from(record.rssi)),
            ],
            Reading::Heartbeat(heartbeat) => vec![
                ("setpoint", heartbeat.setpoint),
                ("window", heartbeat.window),
                ("heat", f64::from(heartbeat.heat)),
                ("cool", f64::from(heartbeat.cool)),
            ],
        }
    }
}
