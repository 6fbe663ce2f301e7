//! Per-channel thermostat: hysteresis control plus the local rotary UI.
//!
//! ```text
//!  Idle            Set               Beacon            Window
//! |65.1/65.0   OFF| |Set Setpoint:  | |Set Tilt Color: | |Set Window:     |
//! |T: 66.0   1.060| |  65.0 F       | |  ORANGE        | |  0.2 F         |
//! ```
//!
//! A button press advances through the states above; turning the knob edits
//! the value shown. After [`IDLE_TIMEOUT`] without input the controller falls
//! back to `Idle`.
//!
//! Mode evaluation is paced by the probe's self-calibrated interval, not by
//! the UI tick, and emits a [`Heartbeat`] every time it runs.

use crate::beacon::{BeaconColor, BeaconSnapshot};
use crate::config::ChannelConfig;
use crate::display::{Presenter, View, render};
use crate::hardware::{Actuator, CharacterDisplay, Rgb, RotaryInput};
use crate::reading::{Heartbeat, Reading, utc_now};
use crate::sensor::SensorHandle;
use crate::worker::RunFlag;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Inactivity before an edit state returns to `Idle`.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(4);

/// UI event loop period.
pub const UI_TICK: Duration = Duration::from_millis(100);

/// Setpoint change per encoder detent.
pub const SETPOINT_STEP: f64 = 0.1;

/// Window change per encoder detent.
pub const WINDOW_STEP: f64 = 0.1;

pub const WINDOW_MIN: f64 = 0.0;
pub const WINDOW_MAX: f64 = 5.0;

/// UI states in button order.
pub const STATES: [ControllerState; 4] = [
    ControllerState::Idle,
    ControllerState::Set,
    ControllerState::Beacon,
    ControllerState::Window,
];

/// Pairing choices in knob order; `None` unpairs.
const BEACON_CHOICES: [Option<BeaconColor>; 9] = [
    None,
    Some(BeaconColor::Red),
    Some(BeaconColor::Green),
    Some(BeaconColor::Black),
    Some(BeaconColor::Purple),
    Some(BeaconColor::Orange),
    Some(BeaconColor::Blue),
    Some(BeaconColor::Yellow),
    Some(BeaconColor::Pink),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Set,
    Beacon,
    Window,
}

impl ControllerState {
    pub fn next(self) -> Self {
        match self {
            ControllerState::Idle => ControllerState::Set,
            ControllerState::Set => ControllerState::Beacon,
            ControllerState::Beacon => ControllerState::Window,
            ControllerState::Window => ControllerState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Invalid,
    Heat,
    Cool,
    Off,
}

impl Mode {
    /// Hysteresis decision for one reading.
    pub fn evaluate(reading: Option<f64>, config: &ChannelConfig) -> Mode {
        match reading {
            None => Mode::Invalid,
            Some(t) if t > config.setpoint + config.window => Mode::Cool,
            Some(t) if t < config.setpoint - config.window => Mode::Heat,
            Some(_) => Mode::Off,
        }
    }

    /// `(heat, cool)` output levels.
    pub fn outputs(self) -> (bool, bool) {
        match self {
            Mode::Heat => (true, false),
            Mode::Cool => (false, true),
            Mode::Invalid | Mode::Off => (false, false),
        }
    }

    /// Four-column label for the display.
    pub fn label(self) -> &'static str {
        match self {
            Mode::Invalid => "INV",
            Mode::Heat => "HEAT",
            Mode::Cool => "COOL",
            Mode::Off => "OFF",
        }
    }

    fn indicator(self) -> Rgb {
        match self {
            Mode::Invalid => Rgb::YELLOW,
            Mode::Heat => Rgb::RED,
            Mode::Cool => Rgb::BLUE,
            Mode::Off => Rgb::BLACK,
        }
    }
}

fn percent(on: bool) -> u8 {
    if on { 100 } else { 0 }
}

/// Peripherals wired to one channel.
pub struct ChannelHardware {
    pub actuator: Box<dyn Actuator>,
    pub heat_pin: u8,
    pub cool_pin: u8,
    pub input: Option<Box<dyn RotaryInput>>,
    pub display: Option<Box<dyn CharacterDisplay>>,
}

/// Receiving ends handed to the orchestrator.
pub struct ControllerLinks {
    /// Heartbeats for the relay
    pub events: mpsc::UnboundedReceiver<Reading>,
    /// Latest settings, changed whenever the UI edits them
    pub config: watch::Receiver<ChannelConfig>,
}

pub struct ThermostatController {
    name: String,
    config: ChannelConfig,
    published: watch::Sender<ChannelConfig>,
    state: ControllerState,
    mode: Mode,
    sensor: SensorHandle,
    beacons: BeaconSnapshot,
    actuator: Box<dyn Actuator>,
    heat_pin: u8,
    cool_pin: u8,
    input: Option<Box<dyn RotaryInput>>,
    presenter: Presenter,
    events: mpsc::UnboundedSender<Reading>,
    idle_deadline: Instant,
    last_evaluation: Option<Instant>,
    last_button: bool,
    last_position: i32,
    shown_temperature: Option<f64>,
    beacon_values: Option<(f64, f64)>,
}

impl ThermostatController {
    pub fn new(
        name: impl Into<String>,
        config: ChannelConfig,
        sensor: SensorHandle,
        beacons: BeaconSnapshot,
        hardware: ChannelHardware,
    ) -> (Self, ControllerLinks) {
        let name = name.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (published, config_rx) = watch::channel(config.clone());

        let mut controller = Self {
            presenter: Presenter::new(name.clone(), hardware.display),
            name,
            config,
            published,
            state: ControllerState::Idle,
            mode: Mode::Invalid,
            sensor,
            beacons,
            actuator: hardware.actuator,
            heat_pin: hardware.heat_pin,
            cool_pin: hardware.cool_pin,
            input: hardware.input,
            events: events_tx,
            idle_deadline: Instant::now(),
            last_evaluation: None,
            last_button: false,
            last_position: 0,
            shown_temperature: None,
            beacon_values: None,
        };
        controller.drive(false, false);
        if let Some((pressed, position)) = controller.read_input() {
            controller.last_button = pressed;
            controller.last_position = position;
        }

        (
            controller,
            ControllerLinks {
                events: events_rx,
                config: config_rx,
            },
        )
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Button rising edge: advance to the next UI state.
    pub fn press(&mut self, now: Instant) {
        self.state = self.state.next();
        debug!(channel = %self.name, "Button press; new state: {:?}", self.state);
        self.idle_deadline = now + IDLE_TIMEOUT;
    }

    /// Knob moved by `delta` detents; edits the value bound to the state.
    ///
    /// Returns `true` if the configuration changed.
    pub fn rotate(&mut self, delta: i32, now: Instant) -> bool {
        let changed = match self.state {
            ControllerState::Idle => false,
            ControllerState::Set => {
                self.config.setpoint += f64::from(delta) * SETPOINT_STEP;
                info!(channel = %self.name, "New setpoint: {:.1}", self.config.setpoint);
                true
            }
            ControllerState::Beacon => {
                let current = BEACON_CHOICES
                    .iter()
                    .position(|choice| *choice == self.config.beacon)
                    .unwrap_or_default() as i64;
                let next = (current + i64::from(delta)).rem_euclid(BEACON_CHOICES.len() as i64);
                self.config.beacon = BEACON_CHOICES[next as usize];
                info!(
                    channel = %self.name,
                    "New Tilt Color: {}",
                    self.config.beacon.map_or("NONE", BeaconColor::name)
                );
                true
            }
            ControllerState::Window => {
                let window = (self.config.window + f64::from(delta) * WINDOW_STEP)
                    .clamp(WINDOW_MIN, WINDOW_MAX);
                if window != self.config.window {
                    self.config.window = window;
                    info!(channel = %self.name, "New Window: {:.1}", self.config.window);
                    true
                } else {
                    false
                }
            }
        };
        if changed {
            self.config.dirty = true;
            self.idle_deadline = now + IDLE_TIMEOUT;
        }
        changed
    }

    /// Recompute the mode from the latest probe value and drive the outputs.
    ///
    /// Emits a heartbeat regardless of whether anything changed; returns
    /// `true` if the mode did.
    pub fn evaluate(&mut self) -> bool {
        let mode = Mode::evaluate(self.sensor.latest(), &self.config);
        let (heat, cool) = mode.outputs();
        self.drive(heat, cool);
        if let Some(input) = self.input.as_mut()
            && let Err(e) = input.set_indicator(mode.indicator())
        {
            warn!(channel = %self.name, "indicator write failed: {e}");
        }

        let _ = self.events.send(Reading::Heartbeat(Heartbeat {
            source: self.name.clone(),
            timestamp: utc_now(),
            setpoint: self.config.setpoint,
            window: self.config.window,
            heat: percent(heat),
            cool: percent(cool),
        }));

        let changed = mode != self.mode;
        if changed {
            info!(channel = %self.name, "mode {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
        changed
    }

    /// Outputs are exclusive: the one being released goes low first.
    fn drive(&mut self, heat: bool, cool: bool) {
        let order = if heat {
            [(self.cool_pin, cool), (self.heat_pin, heat)]
        } else {
            [(self.heat_pin, heat), (self.cool_pin, cool)]
        };
        for (pin, on) in order {
            if let Err(e) = self.actuator.set_output(pin, on) {
                warn!(channel = %self.name, pin, "output write failed: {e}");
            }
        }
    }

    fn evaluation_due(&self, now: Instant) -> bool {
        match (self.last_evaluation, self.sensor.interval()) {
            (None, _) => true,
            (Some(last), Some(interval)) => now.saturating_duration_since(last) > interval,
            (Some(_), None) => false,
        }
    }

    /// Current `(pressed, position)`; `None` if the encoder faulted this tick.
    fn read_input(&mut self) -> Option<(bool, i32)> {
        let Some(input) = self.input.as_mut() else {
            return Some((self.last_button, self.last_position));
        };
        let pressed = match input.pressed() {
            Ok(pressed) => pressed,
            Err(e) => {
                error!(channel = %self.name, "Button read failure: {e}");
                return None;
            }
        };
        let position = match input.position() {
            Ok(position) => position,
            Err(e) => {
                error!(channel = %self.name, "Rotary read failure: {e}");
                return None;
            }
        };
        Some((pressed, position))
    }

    fn update_display(&mut self) {
        if self.state == ControllerState::Idle {
            self.shown_temperature = self.sensor.latest();
        }
        let lines = render(&View {
            state: self.state,
            mode: self.mode,
            config: &self.config,
            temperature: self.sensor.latest(),
            beacon: self.beacon_values,
        });
        self.presenter.show(lines);
    }

    fn publish_config(&mut self) {
        if self.config.dirty {
            self.published.send_replace(self.config.clone());
            self.config.dirty = false;
        }
    }

    /// One pass of the UI loop at time `now`.
    pub fn tick(&mut self, now: Instant) {
        let mut display_update = false;

        if self.evaluation_due(now) {
            let first = self.last_evaluation.is_none();
            self.last_evaluation = Some(now);
            display_update |= self.evaluate() || first;
        }

        if let Some((pressed, position)) = self.read_input() {
            if pressed && !self.last_button {
                self.press(now);
                display_update = true;
            } else if position != self.last_position {
                debug!(channel = %self.name, "Rotation: {}", position - self.last_position);
                display_update |= self.rotate(position - self.last_position, now);
            }
            self.last_button = pressed;
            self.last_position = position;
        }

        let beacon_values = self
            .config
            .beacon
            .and_then(|color| self.beacons.last(color))
            .map(|record| (f64::from(record.temp_raw), record.specific_gravity));
        if beacon_values != self.beacon_values {
            self.beacon_values = beacon_values;
            display_update |= self.state == ControllerState::Idle;
        }

        if self.state != ControllerState::Idle && now > self.idle_deadline {
            debug!(channel = %self.name, "Idle timeout");
            self.state = ControllerState::Idle;
            display_update = true;
        }

        if self.state == ControllerState::Idle && self.shown_temperature != self.sensor.latest() {
            display_update = true;
        }

        if display_update {
            self.update_display();
        }
        self.publish_config();
    }

    /// Outputs off, indicator dark, display blank.
    pub fn shutdown(&mut self) {
        self.drive(false, false);
        if let Some(input) = self.input.as_mut() {
            let _ = input.set_indicator(Rgb::BLACK);
        }
        self.presenter.clear();
        self.publish_config();
    }

    /// Controller worker loop.
    pub async fn run(mut self, flag: RunFlag) {
        let mut ticker = tokio::time::interval(UI_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while flag.is_running() {
            ticker.tick().await;
            self.tick(Instant::now());
        }
        self.shutdown();
        debug!(channel = %self.name, "controller stopped");
    }
}
