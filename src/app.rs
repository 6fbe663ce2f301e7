//! Core application runner for `tilt-relay`.
//!
//! This module is decoupled from CLI parsing and process exit codes so it can
//! be tested deterministically: the board, the advertisement source, the
//! telemetry store and the shutdown trigger are all injected.

use crate::beacon::{AdvertisementSource, Backend, BeaconScanner, RealScanner};
use crate::config::{CHANNEL_SECTIONS, ChannelConfig, Settings, SystemConfig};
use crate::controller::{ChannelHardware, ThermostatController};
use crate::display::{Presenter, run_system_display};
use crate::hardware::Board;
use crate::reading::Reading;
use crate::relay::adafruit::AdafruitIo;
use crate::relay::{ApiError, TelemetryApi, TelemetryRelay};
use crate::sensor::{DEFAULT_W1_ROOT, OneWireSensor, SensorChannel};
use crate::worker::RunFlag;
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Period of the main loop (sensor polling and config flushing).
pub const MAIN_LOOP_PERIOD: Duration = Duration::from_millis(250);

pub const SYSTEM_DISPLAY_ADDR: u16 = 0x25;

/// Wiring of one thermostat channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLayout {
    pub name: &'static str,
    /// Config file section
    pub section: &'static str,
    /// Probe name in telemetry
    pub sensor: &'static str,
    pub bus: &'static str,
    pub heat_pin: u8,
    pub cool_pin: u8,
    pub display_addr: u16,
    pub rotary_addr: u16,
}

pub const CHANNELS: [ChannelLayout; 2] = [
    ChannelLayout {
        name: "ctrl-1",
        section: CHANNEL_SECTIONS[0],
        sensor: "temp1",
        bus: "w1_bus_master2",
        heat_pin: 4,
        cool_pin: 22,
        display_addr: 0x26,
        rotary_addr: 0x37,
    },
    ChannelLayout {
        name: "ctrl-2",
        section: CHANNEL_SECTIONS[1],
        sensor: "temp2",
        bus: "w1_bus_master1",
        heat_pin: 6,
        cool_pin: 26,
        display_addr: 0x27,
        rotary_addr: 0x36,
    },
];

pub const AMBIENT: (&str, &str) = ("ambient", "w1_bus_master3");
pub const GLYCOL: (&str, &str) = ("glycol", "w1_bus_master4");
pub const INTERNAL: (&str, &str) = ("internal", "w1_bus_master5");

/// Configuration for the application.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Configuration file [default: ~/.beercntlr.toml]
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root of the one-wire sysfs tree
    #[arg(long, value_name = "PATH", default_value = DEFAULT_W1_ROOT)]
    pub w1_root: PathBuf,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose output, log debug messages
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the application runner.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// A spawned worker and its run flag.
struct Worker {
    name: &'static str,
    flag: RunFlag,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<F>(name: &'static str, task: impl FnOnce(RunFlag) -> F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let flag = RunFlag::new();
        let handle = tokio::spawn(task(flag.clone()));
        Self { name, flag, handle }
    }
}

/// One-wire probe on `bus`, reporting into a fresh telemetry queue.
fn sensor_channel(
    options: &Options,
    name: &str,
    bus: &str,
    telemetry: &mut Vec<mpsc::UnboundedReceiver<Reading>>,
) -> SensorChannel {
    let (tx, rx) = mpsc::unbounded_channel();
    telemetry.push(rx);
    SensorChannel::new(name, Box::new(OneWireSensor::new(&options.w1_root, bus))).with_queue(tx)
}

/// Pull configs published by the controllers into the settings.
fn collect_configs(
    settings: &mut Settings,
    published: &mut [(&str, watch::Receiver<ChannelConfig>)],
) {
    for (section, rx) in published.iter_mut() {
        if rx.has_changed().unwrap_or(false) {
            let config = rx.borrow_and_update().clone();
            settings.update_channel(*section, config);
        }
    }
}

fn flush(settings: &mut Settings) {
    if settings.is_dirty() {
        debug!("Change found, update configfile");
        if let Err(e) = settings.save() {
            warn!("cannot write {}: {e}", settings.path().display());
        }
    }
}

/// Run with real hardware until `shutdown` resolves.
pub async fn run(options: Options, shutdown: impl Future<Output = ()>) -> Result<(), RunError> {
    #[cfg(feature = "rpi")]
    let mut board = crate::hardware::rpi::PiBoard;
    #[cfg(not(feature = "rpi"))]
    let mut board = crate::hardware::HeadlessBoard;

    let scanner = RealScanner::new(options.backend);
    run_with(
        options,
        &mut board,
        &scanner,
        |system: &SystemConfig| AdafruitIo::new(&system.aio_user, &system.aio_key),
        shutdown,
    )
    .await
}

/// Wire every worker, run the main loop until `shutdown` resolves, then stop
/// intake, join the workers and flush the configuration.
///
/// `connect` is only called when telemetry credentials are configured.
pub async fn run_with<A, F>(
    options: Options,
    board: &mut dyn Board,
    source: &dyn AdvertisementSource,
    connect: F,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError>
where
    A: TelemetryApi + 'static,
    F: FnOnce(&SystemConfig) -> Result<A, ApiError>,
{
    let config_path = options
        .config
        .clone()
        .unwrap_or_else(crate::config::default_config_path);
    let mut settings = Settings::load(config_path);
    let mut telemetry: Vec<mpsc::UnboundedReceiver<Reading>> = Vec::new();
    let mut intake = Vec::new();
    let mut workers = Vec::new();

    let (beacons, beacon_queues) = BeaconScanner::new();
    let snapshot = beacons.snapshot();
    telemetry.extend(beacon_queues);
    match source.start().await {
        Ok(advertisements) => {
            intake.push(Worker::spawn("tilt", |flag| beacons.run(advertisements, flag)));
        }
        Err(e) => warn!("Beacon scanning unavailable: {e}"),
    }

    let mut sensors = Vec::new();
    let mut published = Vec::new();
    for layout in &CHANNELS {
        let sensor = sensor_channel(&options, layout.sensor, layout.bus, &mut telemetry);
        let hardware = ChannelHardware {
            actuator: board.actuator(&[layout.heat_pin, layout.cool_pin]),
            heat_pin: layout.heat_pin,
            cool_pin: layout.cool_pin,
            input: board.rotary(layout.rotary_addr),
            display: board.display(layout.display_addr),
        };
        let (controller, links) = ThermostatController::new(
            layout.name,
            settings.channel(layout.section),
            sensor.handle(),
            snapshot.clone(),
            hardware,
        );
        telemetry.push(links.events);
        published.push((layout.section, links.config));
        workers.push(Worker::spawn(layout.name, |flag| controller.run(flag)));
        sensors.push(sensor);
    }

    let ambient = sensor_channel(&options, AMBIENT.0, AMBIENT.1, &mut telemetry);
    let glycol = sensor_channel(&options, GLYCOL.0, GLYCOL.1, &mut telemetry);
    let internal = sensor_channel(&options, INTERNAL.0, INTERNAL.1, &mut telemetry);
    let presenter = Presenter::new("system", board.display(SYSTEM_DISPLAY_ADDR));
    let (ambient_handle, glycol_handle) = (ambient.handle(), glycol.handle());
    workers.push(Worker::spawn("system", |flag| {
        run_system_display(presenter, ambient_handle, glycol_handle, flag)
    }));
    sensors.extend([ambient, glycol, internal]);

    if settings.system.has_credentials() {
        match connect(&settings.system) {
            Ok(api) => {
                let mut relay = TelemetryRelay::new(
                    api,
                    settings.system.group.clone(),
                    Duration::from_secs(settings.system.interval),
                );
                for queue in telemetry.drain(..) {
                    relay.add_queue(queue);
                }
                workers.push(Worker::spawn("relay", |flag| relay.run(flag)));
            }
            Err(e) => warn!("Telemetry disabled: {e}"),
        }
    } else {
        info!(
            "Set aio_user / aio_key in {} to upload data",
            settings.path().display()
        );
    }
    // Undrained queues would grow forever; producers tolerate a closed queue.
    drop(telemetry);

    debug!("Starting main loop");
    let mut ticker = tokio::time::interval(MAIN_LOOP_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }
        for sensor in &mut sensors {
            sensor.poll();
        }
        collect_configs(&mut settings, &mut published);
        flush(&mut settings);
    }

    warn!("Shutting down");
    for worker in intake.iter().chain(&workers) {
        worker.flag.stop();
    }
    for worker in intake.into_iter().chain(workers) {
        worker.handle.await?;
        debug!("{} done", worker.name);
    }

    collect_configs(&mut settings, &mut published);
    flush(&mut settings);
    Ok(())
}
