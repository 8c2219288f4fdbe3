//! In-memory dongle for tests and demos.
//!
//! [`FakeDongleIo`] satisfies the [`DongleIo`](crate::device::DongleIo)
//! seam with a `tokio::io::duplex` pipe instead of a serial device. The far
//! end runs a little dongle: it completes the framing handshake, answers
//! the RPC connect with a configurable version, turns radio pings into
//! robot power-on announcements, and echoes every robot-bound packet back,
//! acting as a loopback robot fleet.
//!
//! `plug`/`unplug` emulate physically inserting and yanking the device.

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::sync::oneshot;
use tracing::debug;

use botlink_core::proto::{DongleReply, DongleRequest, RobotAnnounce, RPC_VERSION};
use botlink_core::{
    AddressedPacket, DevicePath, SerialId, Status, Version, CONTROL_CHANNEL,
};
use botlink_framing::ReliableLink;

use crate::device::{DongleIo, DongleStream};

/// Firmware version the fake fleet reports in announcements.
const FAKE_FIRMWARE: Version = Version::new(4, 7, 3);

struct Inner {
    present: bool,
    version: Version,
    kill: Option<oneshot::Sender<()>>,
}

pub struct FakeDongleIo {
    inner: Mutex<Inner>,
}

impl FakeDongleIo {
    /// A dongle that is plugged in and speaks the daemon's RPC version.
    pub fn new() -> Self {
        Self::with_version(RPC_VERSION)
    }

    /// A dongle that is not plugged in yet; call [`plug`](Self::plug).
    pub fn absent() -> Self {
        let io = Self::new();
        io.inner.lock().expect("fake dongle mutex poisoned").present = false;
        io
    }

    /// A dongle advertising a different RPC version, for mismatch tests.
    pub fn with_version(version: Version) -> Self {
        Self {
            inner: Mutex::new(Inner { present: true, version, kill: None }),
        }
    }

    /// Make the device appear on the bus.
    pub fn plug(&self) {
        self.inner.lock().expect("fake dongle mutex poisoned").present = true;
    }

    /// Yank the device: it disappears from enumeration and the live byte
    /// stream collapses, as a real unplug does.
    pub fn unplug(&self) {
        let mut inner = self.inner.lock().expect("fake dongle mutex poisoned");
        inner.present = false;
        if let Some(kill) = inner.kill.take() {
            let _ = kill.send(());
        }
    }
}

impl Default for FakeDongleIo {
    fn default() -> Self {
        Self::new()
    }
}

impl DongleIo for FakeDongleIo {
    fn find_dongle_path(&self) -> Option<DevicePath> {
        let inner = self.inner.lock().expect("fake dongle mutex poisoned");
        inner.present.then(|| DevicePath::new("/dev/ttyFAKE0"))
    }

    fn open(&self, _path: &DevicePath) -> io::Result<DongleStream> {
        let (local, remote) = tokio::io::duplex(4096);
        let (kill_tx, kill_rx) = oneshot::channel();
        let version = {
            let mut inner = self.inner.lock().expect("fake dongle mutex poisoned");
            inner.kill = Some(kill_tx);
            inner.version
        };
        tokio::spawn(run_fake_dongle(remote, version, kill_rx));
        Ok(Box::new(local))
    }
}

async fn run_fake_dongle(
    stream: DuplexStream,
    version: Version,
    mut kill: oneshot::Receiver<()>,
) {
    let Ok((tx, mut rx)) = ReliableLink::connect(stream, Duration::from_secs(5)).await else {
        debug!("fake dongle handshake failed");
        return;
    };

    loop {
        tokio::select! {
            _ = &mut kill => {
                debug!("fake dongle unplugged");
                return;
            }
            message = rx.recv() => {
                let Ok(message) = message else { return };
                let Ok(packet) = AddressedPacket::decode(&message) else { continue };

                if packet.port == CONTROL_CHANNEL && packet.serial_id == SerialId::DONGLE {
                    match bincode::deserialize::<DongleRequest>(&packet.payload) {
                        Ok(DongleRequest::Connect { .. }) => {
                            let reply = DongleReply::Connect { status: Status::Ok, version };
                            if send_control(&tx, SerialId::DONGLE, &reply).await.is_err() {
                                return;
                            }
                        }
                        Ok(DongleRequest::Ping { destinations }) => {
                            // A pinged robot answers with its power-on
                            // announcement.
                            for serial in destinations {
                                let announce = RobotAnnounce {
                                    firmware_version: FAKE_FIRMWARE,
                                    rpc_version: version,
                                    interface_version: RPC_VERSION,
                                };
                                if send_control(&tx, serial, &announce).await.is_err() {
                                    return;
                                }
                            }
                            let reply = DongleReply::Ping { status: Status::Ok };
                            if send_control(&tx, SerialId::DONGLE, &reply).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => continue,
                    }
                } else {
                    // Loopback robot: whatever a client sends comes back.
                    if tx.send(packet.encode().into()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn send_control<T: serde::Serialize>(
    tx: &botlink_framing::LinkSender,
    serial_id: SerialId,
    body: &T,
) -> Result<(), botlink_framing::FramingError> {
    let payload = bincode::serialize(body).expect("fake dongle serialization should not fail");
    let packet = AddressedPacket::new(serial_id, CONTROL_CHANNEL, payload)
        .expect("fake dongle reply fits a packet");
    tx.send(packet.encode().into()).await
}
