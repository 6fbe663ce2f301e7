//! Capability traits for the physical peripherals.
//!
//! Display, rotary encoder and relay drivers live outside this crate; the
//! controller and presenters only see these traits. A [`Board`] hands out the
//! peripherals that are actually present, anything missing comes back as
//! `None` (or a no-op actuator) and the consumer degrades instead of failing.

use thiserror::Error;
use tracing::{trace, warn};

/// Hardware fault classification.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// Device is not connected; stays that way until physically restored.
    #[error("device not present: {0}")]
    Absent(String),
    /// A single read or write failed (I2C glitch, bus timeout); retry next cycle.
    #[error("transient fault: {0}")]
    Transient(String),
}

/// RGB colour for the indicator LED on the rotary encoder board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const RED: Rgb = Rgb(255, 0, 0);
    pub const YELLOW: Rgb = Rgb(255, 150, 0);
    pub const BLUE: Rgb = Rgb(0, 0, 255);
    pub const BLACK: Rgb = Rgb(0, 0, 0);
}

/// Two-line character display.
pub trait CharacterDisplay: Send {
    /// Write `text` to `row` (0-based).
    fn write_line(&mut self, row: usize, text: &str) -> Result<(), HardwareError>;
}

/// Binary outputs driving the heat and cool relays.
pub trait Actuator: Send {
    fn set_output(&mut self, pin: u8, on: bool) -> Result<(), HardwareError>;
}

/// Rotary encoder with push button and indicator LED.
pub trait RotaryInput: Send {
    /// Absolute detent count, increasing clockwise.
    fn position(&mut self) -> Result<i32, HardwareError>;
    /// Whether the button is currently held down.
    fn pressed(&mut self) -> Result<bool, HardwareError>;
    fn set_indicator(&mut self, _color: Rgb) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// Source of peripherals for the orchestrator.
pub trait Board {
    /// Character display at the given I2C address, if one answers.
    fn display(&mut self, address: u16) -> Option<Box<dyn CharacterDisplay>>;
    /// Rotary encoder board at the given I2C address, if one answers.
    fn rotary(&mut self, address: u16) -> Option<Box<dyn RotaryInput>>;
    /// Outputs for `pins`, configured low.
    fn actuator(&mut self, pins: &[u8]) -> Box<dyn Actuator>;
}

/// Actuator used when no GPIO access is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullActuator;

impl Actuator for NullActuator {
    fn set_output(&mut self, pin: u8, on: bool) -> Result<(), HardwareError> {
        trace!(pin, on, "output (no gpio)");
        Ok(())
    }
}

/// Board with no peripherals attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessBoard;

impl Board for HeadlessBoard {
    fn display(&mut self, address: u16) -> Option<Box<dyn CharacterDisplay>> {
        warn!("LCD [{address:#x}] not available");
        None
    }

    fn rotary(&mut self, address: u16) -> Option<Box<dyn RotaryInput>> {
        warn!("Rotary/LED [{address:#x}] not available");
        None
    }

    fn actuator(&mut self, _pins: &[u8]) -> Box<dyn Actuator> {
        Box::new(NullActuator)
    }
}

#[cfg(feature = "rpi")]
pub mod rpi {
    //! Raspberry Pi GPIO outputs via `rppal`.

    use super::{Actuator, Board, CharacterDisplay, HardwareError, NullActuator, RotaryInput};
    use rppal::gpio::{Gpio, OutputPin};
    use std::collections::HashMap;
    use tracing::warn;

    impl From<rppal::gpio::Error> for HardwareError {
        fn from(err: rppal::gpio::Error) -> Self {
            HardwareError::Absent(err.to_string())
        }
    }

    /// Relay outputs on BCM-numbered GPIO pins.
    pub struct GpioActuator {
        pins: HashMap<u8, OutputPin>,
    }

    impl GpioActuator {
        pub fn new(pins: &[u8]) -> Result<Self, HardwareError> {
            let gpio = Gpio::new()?;
            let mut outputs = HashMap::new();
            for &pin in pins {
                outputs.insert(pin, gpio.get(pin)?.into_output_low());
            }
            Ok(Self { pins: outputs })
        }
    }

    impl Actuator for GpioActuator {
        fn set_output(&mut self, pin: u8, on: bool) -> Result<(), HardwareError> {
            let output = self
                .pins
                .get_mut(&pin)
                .ok_or_else(|| HardwareError::Absent(format!("gpio {pin} not configured")))?;
            if on {
                output.set_high();
            } else {
                output.set_low();
            }
            Ok(())
        }
    }

    /// Raspberry Pi with relay outputs on GPIO; displays and encoders are
    /// driven by external services and are reported missing here.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PiBoard;

    impl Board for PiBoard {
        fn display(&mut self, address: u16) -> Option<Box<dyn CharacterDisplay>> {
            warn!("LCD [{address:#x}] not available");
            None
        }

        fn rotary(&mut self, address: u16) -> Option<Box<dyn RotaryInput>> {
            warn!("Rotary/LED [{address:#x}] not available");
            None
        }

        fn actuator(&mut self, pins: &[u8]) -> Box<dyn Actuator> {
            match GpioActuator::new(pins) {
                Ok(actuator) => Box::new(actuator),
                Err(e) => {
                    warn!("GPIO outputs {pins:?} not available: {e}");
                    Box::new(NullActuator)
                }
            }
        }
    }
}
