//! BlueZ D-Bus backend for Tilt scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, APPLE_COMPANY_ID, APPLE_COMPANY_ID_BYTES, Advertisement,
    MANUFACTURER_DATA_TYPE, ScanError,
};
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Start a passive scan for Apple manufacturer data.
///
/// Every device matching the monitor pattern gets one task that forwards
/// manufacturer data updates, tagged with the most recent RSSI, until BlueZ
/// reports the device lost or the receiver is dropped.
pub async fn start_scan() -> Result<mpsc::Receiver<Advertisement>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    let pattern = Pattern {
        data_type: MANUFACTURER_DATA_TYPE,
        start_position: 0,
        content: APPLE_COMPANY_ID_BYTES.to_vec(),
    };

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![pattern]),
            ..Default::default()
        })
        .await?;

    tokio::spawn(async move {
        // Keep all Bluetooth state alive by moving it into this task
        let _session = session;
        let _monitor_manager = monitor_manager;
        let mut followers = Followers::default();

        while let Some(event) = monitor_handle.next().await {
            if tx.is_closed() {
                break;
            }
            match event {
                MonitorEvent::DeviceFound(device_id) => {
                    let address = device_id.device;
                    match adapter.device(address) {
                        Ok(device) => {
                            let tx = tx.clone();
                            followers.follow(address, || tokio::spawn(follow_device(device, tx)));
                        }
                        Err(e) => debug!("cannot open device {address}: {e}"),
                    }
                }
                MonitorEvent::DeviceLost(device_id) => followers.lose(device_id.device),
                _ => {}
            }
        }
        followers.clear();
    });

    Ok(rx)
}

/// One forwarding task per device address.
#[derive(Default)]
struct Followers {
    tasks: HashMap<Address, JoinHandle<()>>,
}

impl Followers {
    /// Start following `address` unless a live task already does.
    fn follow(&mut self, address: Address, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        if let Some(task) = self.tasks.get(&address)
            && !task.is_finished()
        {
            trace!("already following {address}");
            return false;
        }
        self.tasks.insert(address, spawn());
        true
    }

    fn lose(&mut self, address: Address) {
        if let Some(task) = self.tasks.remove(&address) {
            debug!("lost {address}");
            task.abort();
        }
    }

    fn clear(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Forward the current and every subsequent advertisement of one device.
async fn follow_device(device: Device, tx: mpsc::Sender<Advertisement>) {
    let address = device.address();
    let mut rssi = device.rssi().await.ok().flatten().unwrap_or_default();

    if let Ok(Some(data)) = device.manufacturer_data().await
        && tx.send(advertisement(&data, rssi)).await.is_err()
    {
        return;
    }

    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            debug!("cannot follow device {address}: {e}");
            return;
        }
    };
    futures::pin_mut!(events);

    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(property) = event {
            match property {
                DeviceProperty::Rssi(value) => rssi = value,
                DeviceProperty::ManufacturerData(data) => {
                    trace!("advertisement from {address}");
                    if tx.send(advertisement(&data, rssi)).await.is_err() {
                        break;
                    }
                }
                _ => {}
            }
        }
    }
}

/// BlueZ strips the company id; put it back so the decoder sees the raw layout.
fn advertisement(data: &HashMap<u16, Vec<u8>>, rssi: i16) -> Advertisement {
    Advertisement {
        manufacturer_data: data.get(&APPLE_COMPANY_ID).map(|payload| {
            let mut bytes = Vec::with_capacity(2 + payload.len());
            bytes.extend_from_slice(&APPLE_COMPANY_ID_BYTES);
            bytes.extend_from_slice(payload);
            bytes
        }),
        rssi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{BeaconColor, decode_advertisement};
    use crate::test_utils::tilt_payload;

    #[test]
    fn test_advertisement_restores_company_id() {
        let full = tilt_payload(BeaconColor::Green, 64, 1012, 2);
        let mut data = HashMap::new();
        data.insert(APPLE_COMPANY_ID, full[2..].to_vec());

        let adv = advertisement(&data, -55);
        assert_eq!(adv.manufacturer_data.as_deref(), Some(&full[..]));
        let record = decode_advertisement(&adv, 0.0).unwrap();
        assert_eq!(record.color, BeaconColor::Green);
        assert_eq!(record.rssi, -55);
    }

    #[tokio::test]
    async fn test_device_is_followed_once_until_lost() {
        let address = Address::new([0xC4, 0x7C, 0x8D, 0x6A, 0x12, 0x01]);
        let mut followers = Followers::default();
        let mut spawned = 0;
        let mut spawn = || {
            spawned += 1;
            tokio::spawn(std::future::pending::<()>())
        };

        assert!(followers.follow(address, &mut spawn));
        assert!(!followers.follow(address, &mut spawn));
        assert_eq!(followers.len(), 1);

        followers.lose(address);
        assert_eq!(followers.len(), 0);
        assert!(followers.follow(address, &mut spawn));
        assert_eq!(followers.len(), 1);
        followers.clear();
        assert_eq!(followers.len(), 0);
        assert_eq!(spawned, 2);
    }

    #[tokio::test]
    async fn test_finished_follower_is_replaced() {
        let address = Address::new([0xC4, 0x7C, 0x8D, 0x6A, 0x12, 0x02]);
        let mut followers = Followers::default();
        assert!(followers.follow(address, || tokio::spawn(async {})));
        while !followers.tasks[&address].is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(followers.follow(address, || tokio::spawn(async {})));
        assert_eq!(followers.len(), 1);
    }

    #[test]
    fn test_advertisement_without_apple_data() {
        let mut data = HashMap::new();
        data.insert(0x0499, vec![0x05, 0x01]);
        assert_eq!(advertisement(&data, -40).manufacturer_data, None);
    }
}
