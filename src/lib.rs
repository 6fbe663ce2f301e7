//! `tilt-relay` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup,
//! signals and process exit codes. The workers live in their own modules and
//! are wired together by [`crate::app`], where everything hardware- or
//! network-facing is injected so it can be tested deterministically.

pub mod app;
pub mod beacon;
pub mod config;
pub mod controller;
pub mod display;
pub mod hardware;
pub mod reading;
pub mod relay;
pub mod sensor;
pub mod worker;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use beacon::{BeaconColor, BeaconRecord, DecodeError, decode_beacon};
pub use config::{ChannelConfig, Settings};
pub use controller::{ControllerState, Mode, STATES, ThermostatController};
pub use reading::Reading;
pub use relay::{ApiError, TelemetryApi, TelemetryRelay};
pub use sensor::{SensorChannel, millicelsius_to_fahrenheit};
pub use worker::RunFlag;
