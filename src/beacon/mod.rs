//! Tilt hydrometer beacon decoding and scanning.
//!
//! Tilt hydrometers broadcast Apple iBeacon frames. The 16-byte proximity
//! UUID identifies the hydrometer's colour, the major field carries the
//! temperature (°F) and the minor field the specific gravity times 1000.
//! See: https://kvurd.com/blog/tilt-hydrometer-ibeacon-data-format/

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::reading::{Reading, utc_now};
use crate::worker::RunFlag;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Apple Inc. Bluetooth company identifier.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Apple company identifier as it appears on air (little-endian).
pub const APPLE_COMPANY_ID_BYTES: [u8; 2] = [0x4C, 0x00];

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
pub const MANUFACTURER_DATA_TYPE: u8 = 0xff;

/// iBeacon subtype following the company identifier.
pub const IBEACON_SUBTYPE: u8 = 0x02;

/// Company id (2) + subtype (1) + length (1) + UUID (16) + major (2) + minor (2) + tx (1).
pub const MIN_PAYLOAD_LEN: usize = 25;

/// Channel buffer size for advertisements coming from a backend.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Pause between drained advertisement batches.
pub const SCAN_YIELD: Duration = Duration::from_millis(100);

const UUID_OFFSET: usize = 4;
const UUID_LEN: usize = 16;
const MAJOR_OFFSET: usize = 20;
const MINOR_OFFSET: usize = 22;
const TX_POWER_OFFSET: usize = 24;

/// Tilt UUIDs differ only in the high nibble of byte 3.
const TILT_UUID_BASE: [u8; UUID_LEN] = [
    0xA4, 0x95, 0xBB, 0x00, 0xC5, 0xB1, 0x4B, 0x44, 0xB5, 0x12, 0x13, 0x70, 0xF0, 0x2D, 0x74, 0xDE,
];

/// The eight Tilt hydrometer colours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeaconColor {
    Red,
    Green,
    Black,
    Purple,
    Orange,
    Blue,
    Yellow,
    Pink,
}

impl BeaconColor {
    pub const ALL: [BeaconColor; 8] = [
        BeaconColor::Red,
        BeaconColor::Green,
        BeaconColor::Black,
        BeaconColor::Purple,
        BeaconColor::Orange,
        BeaconColor::Blue,
        BeaconColor::Yellow,
        BeaconColor::Pink,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BeaconColor::Red => "RED",
            BeaconColor::Green => "GREEN",
            BeaconColor::Black => "BLACK",
            BeaconColor::Purple => "PURPLE",
            BeaconColor::Orange => "ORANGE",
            BeaconColor::Blue => "BLUE",
            BeaconColor::Yellow => "YELLOW",
            BeaconColor::Pink => "PINK",
        }
    }

    /// Telemetry source name for this colour's readings.
    pub fn source_name(self) -> &'static str {
        match self {
            BeaconColor::Red => "tilt-RED",
            BeaconColor::Green => "tilt-GREEN",
            BeaconColor::Black => "tilt-BLACK",
            BeaconColor::Purple => "tilt-PURPLE",
            BeaconColor::Orange => "tilt-ORANGE",
            BeaconColor::Blue => "tilt-BLUE",
            BeaconColor::Yellow => "tilt-YELLOW",
            BeaconColor::Pink => "tilt-PINK",
        }
    }

    pub fn uuid(self) -> [u8; UUID_LEN] {
        let mut uuid = TILT_UUID_BASE;
        uuid[3] = ((self.index() as u8) + 1) << 4;
        uuid
    }

    /// Exact lookup of a 16-byte identifier.
    pub fn from_uuid(uuid: &[u8]) -> Option<BeaconColor> {
        Self::ALL.into_iter().find(|color| color.uuid() == uuid)
    }
}

impl fmt::Display for BeaconColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BeaconColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|color| color.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tilt color: {s}"))
    }
}

/// One decoded hydrometer advertisement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeaconRecord {
    pub color: BeaconColor,
    /// Temperature as broadcast (°F, or tenths on Tilt Pro)
    pub temp_raw: u16,
    pub specific_gravity: f64,
    /// Calibrated tx power byte
    pub tx_power: u8,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// UTC seconds
    pub timestamp: f64,
}

/// A raw BLE advertisement from a backend.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Advertisement {
    /// Manufacturer-specific data including the 2-byte company identifier
    pub manufacturer_data: Option<Vec<u8>>,
    pub rssi: i16,
}

/// Reasons an advertisement does not yield a record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("No manufacturer data")]
    MissingManufacturerData,
    #[error("Payload too short: {0} bytes")]
    TooShort(usize),
    #[error("Not an iBeacon: company {company:#06x} subtype {subtype:#04x}")]
    NotIBeacon { company: u16, subtype: u8 },
    #[error("Unknown tilt color uuid: {0}")]
    UnknownIdentifier(String),
}

/// Error type for scanner backends.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in or disabled)
    #[error("Backend '{0}' not available")]
    BackendNotAvailable(String),
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// No scanning; beacon values stay empty
    None,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(not(feature = "bluer"))]
        return Backend::None;
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            Backend::None => write!(f, "none"),
        }
    }
}

/// Source of BLE advertisements, so the scanner can run without hardware.
pub trait AdvertisementSource: Send + Sync {
    fn start(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>>;
}

/// Advertisement source backed by the compiled-in Bluetooth backends.
#[derive(Debug, Clone, Copy)]
pub struct RealScanner {
    backend: Backend,
}

impl RealScanner {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

impl AdvertisementSource for RealScanner {
    fn start(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>>
    {
        Box::pin(async move {
            match self.backend {
                #[cfg(feature = "bluer")]
                Backend::Bluer => bluer::start_scan().await,
                Backend::None => Err(ScanError::BackendNotAvailable(self.backend.to_string())),
            }
        })
    }
}

/// Decode Tilt manufacturer data into a record.
///
/// Decoding is stateless per advertisement; every packet stands alone.
pub fn decode_beacon(data: &[u8], rssi: i16, timestamp: f64) -> Result<BeaconRecord, DecodeError> {
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }

    let company = u16::from_le_bytes([data[0], data[1]]);
    let subtype = data[2];
    if company != APPLE_COMPANY_ID || subtype != IBEACON_SUBTYPE {
        return Err(DecodeError::NotIBeacon { company, subtype });
    }

    let uuid = &data[UUID_OFFSET..UUID_OFFSET + UUID_LEN];
    let color = BeaconColor::from_uuid(uuid).ok_or_else(|| {
        DecodeError::UnknownIdentifier(uuid.iter().map(|b| format!("{b:02X}")).collect())
    })?;

    let temp_raw = u16::from_be_bytes([data[MAJOR_OFFSET], data[MAJOR_OFFSET + 1]]);
    let gravity = u16::from_be_bytes([data[MINOR_OFFSET], data[MINOR_OFFSET + 1]]);

    Ok(BeaconRecord {
        color,
        temp_raw,
        specific_gravity: f64::from(gravity) / 1000.0,
        tx_power: data[TX_POWER_OFFSET],
        rssi,
        timestamp,
    })
}

/// Decode an advertisement as received from a backend.
pub fn decode_advertisement(
    advertisement: &Advertisement,
    timestamp: f64,
) -> Result<BeaconRecord, DecodeError> {
    let data = advertisement
        .manufacturer_data
        .as_deref()
        .ok_or(DecodeError::MissingManufacturerData)?;
    decode_beacon(data, advertisement.rssi, timestamp)
}

/// Last decoded record per colour.
///
/// One fixed slot per colour, written only by the scanner. Readers get
/// copies through a [`BeaconSnapshot`].
#[derive(Debug)]
pub struct BeaconCache {
    slots: [watch::Sender<Option<BeaconRecord>>; 8],
}

impl BeaconCache {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| watch::channel(None).0),
        }
    }

    pub fn store(&self, record: BeaconRecord) {
        self.slots[record.color.index()].send_replace(Some(record));
    }

    pub fn snapshot(&self) -> BeaconSnapshot {
        BeaconSnapshot {
            slots: std::array::from_fn(|i| self.slots[i].subscribe()),
        }
    }
}

impl Default for BeaconCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the [`BeaconCache`].
#[derive(Debug, Clone)]
pub struct BeaconSnapshot {
    slots: [watch::Receiver<Option<BeaconRecord>>; 8],
}

impl BeaconSnapshot {
    pub fn last(&self, color: BeaconColor) -> Option<BeaconRecord> {
        *self.slots[color.index()].borrow()
    }
}

/// Beacon scanning worker: decodes advertisements, updates the cache and
/// feeds one telemetry queue per colour.
pub struct BeaconScanner {
    cache: BeaconCache,
    queues: [mpsc::UnboundedSender<Reading>; 8],
}

impl BeaconScanner {
    /// Create the scanner and the per-colour queue receivers (in
    /// [`BeaconColor::ALL`] order).
    pub fn new() -> (Self, Vec<mpsc::UnboundedReceiver<Reading>>) {
        let mut receivers = Vec::with_capacity(BeaconColor::ALL.len());
        let queues = std::array::from_fn(|_| {
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push(rx);
            tx
        });
        (
            Self {
                cache: BeaconCache::new(),
                queues,
            },
            receivers,
        )
    }

    pub fn snapshot(&self) -> BeaconSnapshot {
        self.cache.snapshot()
    }

    /// Process one advertisement; returns the record if it was a Tilt.
    pub fn handle(&mut self, advertisement: &Advertisement) -> Option<BeaconRecord> {
        match decode_advertisement(advertisement, utc_now()) {
            Ok(record) => {
                self.cache.store(record);
                let queue = &self.queues[record.color.index()];
                let _ = queue.send(Reading::Beacon(record));
                debug!(color = %record.color, temp = record.temp_raw, sg = record.specific_gravity, "tilt record");
                Some(record)
            }
            Err(DecodeError::UnknownIdentifier(uuid)) => {
                warn!("Got data from unknown tilt color uuid: {uuid}");
                None
            }
            Err(e) => {
                trace!("dropping advertisement: {e}");
                None
            }
        }
    }

    /// Drain advertisements in batches until the flag is cleared or the
    /// source closes.
    pub async fn run(mut self, mut advertisements: mpsc::Receiver<Advertisement>, flag: RunFlag) {
        while flag.is_running() {
            loop {
                match advertisements.try_recv() {
                    Ok(advertisement) => {
                        self.handle(&advertisement);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("advertisement stream closed; beacon scanning stopped");
                        return;
                    }
                }
            }
            tokio::time::sleep(SCAN_YIELD).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tilt_payload;

    #[test]
    fn test_decode_orange() {
        let payload = tilt_payload(BeaconColor::Orange, 6850, 1060, 4);
        assert_eq!(payload.len(), 25);

        let record = decode_beacon(&payload, -67, 100.0).unwrap();
        assert_eq!(record.color, BeaconColor::Orange);
        assert_eq!(record.temp_raw, 6850);
        assert!((record.specific_gravity - 1.060).abs() < 1e-12);
        assert_eq!(record.tx_power, 4);
        assert_eq!(record.rssi, -67);
        assert_eq!(record.timestamp, 100.0);
    }

    #[test]
    fn test_decode_24_bytes_is_rejected() {
        let payload = tilt_payload(BeaconColor::Orange, 6850, 1060, 4);
        assert_eq!(
            decode_beacon(&payload[..24], -67, 0.0),
            Err(DecodeError::TooShort(24))
        );
    }

    #[test]
    fn test_decode_longer_payload_ignores_trailer() {
        let mut payload = tilt_payload(BeaconColor::Pink, 70, 998, 0xC5);
        payload.extend_from_slice(&[0xAA, 0xBB]);
        let record = decode_beacon(&payload, -80, 0.0).unwrap();
        assert_eq!(record.color, BeaconColor::Pink);
        assert_eq!(record.tx_power, 0xC5);
    }

    #[test]
    fn test_decode_wrong_company() {
        let mut payload = tilt_payload(BeaconColor::Red, 70, 1000, 0);
        payload[0] = 0x99;
        payload[1] = 0x04;
        assert!(matches!(
            decode_beacon(&payload, 0, 0.0),
            Err(DecodeError::NotIBeacon { company: 0x0499, .. })
        ));
    }

    #[test]
    fn test_decode_unknown_uuid() {
        let mut payload = tilt_payload(BeaconColor::Red, 70, 1000, 0);
        payload[UUID_OFFSET + 3] = 0x90;
        assert_eq!(
            decode_beacon(&payload, 0, 0.0),
            Err(DecodeError::UnknownIdentifier(
                "A495BB90C5B14B44B5121370F02D74DE".to_string()
            ))
        );
    }

    #[test]
    fn test_color_uuids() {
        assert_eq!(
            BeaconColor::Red.uuid(),
            [
                0xA4, 0x95, 0xBB, 0x10, 0xC5, 0xB1, 0x4B, 0x44, 0xB5, 0x12, 0x13, 0x70, 0xF0, 0x2D,
                0x74, 0xDE
            ]
        );
        assert_eq!(BeaconColor::Pink.uuid()[3], 0x80);
        for color in BeaconColor::ALL {
            assert_eq!(BeaconColor::from_uuid(&color.uuid()), Some(color));
        }
    }

    #[test]
    fn test_color_from_str() {
        assert_eq!("ORANGE".parse::<BeaconColor>(), Ok(BeaconColor::Orange));
        assert_eq!("yellow".parse::<BeaconColor>(), Ok(BeaconColor::Yellow));
        assert!("NONE".parse::<BeaconColor>().is_err());
    }

    #[test]
    fn test_missing_manufacturer_data() {
        let advertisement = Advertisement {
            manufacturer_data: None,
            rssi: -50,
        };
        assert_eq!(
            decode_advertisement(&advertisement, 0.0),
            Err(DecodeError::MissingManufacturerData)
        );
    }

    #[test]
    fn test_scanner_updates_cache_and_queue() {
        let (mut scanner, mut queues) = BeaconScanner::new();
        let snapshot = scanner.snapshot();
        assert_eq!(snapshot.last(BeaconColor::Orange), None);

        for temp in [68, 69] {
            scanner.handle(&Advertisement {
                manufacturer_data: Some(tilt_payload(BeaconColor::Orange, temp, 1050, 4)),
                rssi: -70,
            });
        }

        let last = snapshot.last(BeaconColor::Orange).unwrap();
        assert_eq!(last.temp_raw, 69);
        assert_eq!(snapshot.last(BeaconColor::Red), None);

        let orange = &mut queues[BeaconColor::Orange.index()];
        assert!(matches!(orange.try_recv(), Ok(Reading::Beacon(r)) if r.temp_raw == 68));
        assert!(matches!(orange.try_recv(), Ok(Reading::Beacon(r)) if r.temp_raw == 69));
        assert!(orange.try_recv().is_err());
    }

    #[test]
    fn test_scanner_drops_noise() {
        let (mut scanner, mut queues) = BeaconScanner::new();
        assert!(
            scanner
                .handle(&Advertisement {
                    manufacturer_data: Some(vec![0x4C, 0x00, 0x02]),
                    rssi: -70,
                })
                .is_none()
        );
        assert!(queues.iter_mut().all(|q| q.try_recv().is_err()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_batches_until_source_closes() {
        let (scanner, mut queues) = BeaconScanner::new();
        let snapshot = scanner.snapshot();
        let (tx, rx) = mpsc::channel(8);
        for gravity in [1040, 1041, 1042] {
            tx.send(Advertisement {
                manufacturer_data: Some(tilt_payload(BeaconColor::Blue, 66, gravity, 4)),
                rssi: -60,
            })
            .await
            .unwrap();
        }
        drop(tx);

        scanner.run(rx, RunFlag::new()).await;

        let blue = &mut queues[BeaconColor::Blue.index()];
        let mut count = 0;
        while blue.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(
            snapshot.last(BeaconColor::Blue).map(|r| r.specific_gravity),
            Some(1.042)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_flag() {
        let (scanner, _queues) = BeaconScanner::new();
        let (_tx, rx) = mpsc::channel(1);
        let flag = RunFlag::new();
        flag.stop();
        scanner.run(rx, flag).await;
    }
}
