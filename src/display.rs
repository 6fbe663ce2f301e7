//! Two-line character display rendering.
//!
//! Rendering is a pure function of the controller's state; the [`Presenter`]
//! only touches the hardware when the rendered text actually changed.

use crate::config::ChannelConfig;
use crate::controller::{ControllerState, Mode};
use crate::hardware::CharacterDisplay;
use crate::sensor::SensorHandle;
use crate::worker::RunFlag;
use std::time::Duration;
use tracing::{debug, warn};

/// Columns on the display.
pub const DISPLAY_WIDTH: usize = 16;

/// Refresh period of the system display.
pub const SYSTEM_DISPLAY_PERIOD: Duration = Duration::from_secs(1);

/// Everything the controller display depends on.
#[derive(Debug, Clone, Copy)]
pub struct View<'a> {
    pub state: ControllerState,
    pub mode: Mode,
    pub config: &'a ChannelConfig,
    /// Latest probe temperature
    pub temperature: Option<f64>,
    /// Paired hydrometer `(temperature, gravity)`
    pub beacon: Option<(f64, f64)>,
}

/// Pad or truncate to exactly [`DISPLAY_WIDTH`] characters.
fn fit(line: String) -> String {
    format!("{:<width$.width$}", line, width = DISPLAY_WIDTH)
}

pub fn render(view: &View<'_>) -> [String; 2] {
    let config = view.config;
    let [first, second] = match view.state {
        ControllerState::Idle => {
            let temp = match view.temperature {
                Some(t) => format!("{t:.1}/{:.1}", config.setpoint),
                None => "missing".to_string(),
            };
            let beacon = match (config.beacon, view.beacon) {
                (Some(_), Some((temp, sg))) => format!("T: {temp:<5.1}  {sg:<5.3}"),
                _ => String::new(),
            };
            [format!("{temp:<12}{:<4}", view.mode.label()), beacon]
        }
        ControllerState::Set => [
            "Set Setpoint:".to_string(),
            format!("  {:.1} F", config.setpoint),
        ],
        ControllerState::Beacon => [
            "Set Tilt Color:".to_string(),
            format!("  {}", config.beacon.map_or("NONE", |c| c.name())),
        ],
        ControllerState::Window => [
            "Set Window:".to_string(),
            format!("  {:.1} F", config.window),
        ],
    };
    [fit(first), fit(second)]
}

/// System display: ambient and glycol probe temperatures.
pub fn render_system(ambient: Option<f64>, glycol: Option<f64>) -> [String; 2] {
    let value = |t: Option<f64>| t.map(|t| format!("{t:.1}")).unwrap_or_default();
    [
        fit(format!("{:<12}{:>4}", "Ambient:", value(ambient))),
        fit(format!("{:<12}{:>4}", "Glycol:", value(glycol))),
    ]
}

/// Writes rendered lines to a display, skipping unchanged content.
pub struct Presenter {
    name: String,
    display: Option<Box<dyn CharacterDisplay>>,
    shown: Option<[String; 2]>,
}

impl Presenter {
    pub fn new(name: impl Into<String>, display: Option<Box<dyn CharacterDisplay>>) -> Self {
        Self {
            name: name.into(),
            display,
            shown: None,
        }
    }

    /// Show `lines`; returns `true` if anything was written.
    pub fn show(&mut self, lines: [String; 2]) -> bool {
        if self.shown.as_ref() == Some(&lines) {
            return false;
        }
        for line in &lines {
            debug!("Display Update ({}): {line}", self.name);
        }
        if let Some(display) = self.display.as_mut() {
            for (row, line) in lines.iter().enumerate() {
                if let Err(e) = display.write_line(row, line) {
                    warn!("display {} write failed: {e}", self.name);
                }
            }
        }
        self.shown = Some(lines);
        true
    }

    pub fn clear(&mut self) {
        self.show([" ".repeat(DISPLAY_WIDTH), " ".repeat(DISPLAY_WIDTH)]);
    }
}

/// System display worker.
pub async fn run_system_display(
    mut presenter: Presenter,
    ambient: SensorHandle,
    glycol: SensorHandle,
    flag: RunFlag,
) {
    while flag.is_running() {
        presenter.show(render_system(ambient.latest(), glycol.latest()));
        tokio::time::sleep(SYSTEM_DISPLAY_PERIOD).await;
    }
    presenter.clear();
}
