//! Botlink Core
//!
//! Shared vocabulary of the botlink daemon and its clients: serial
//! identifiers, addressed packets for the radio link, status codes, version
//! triplets and the control-plane wire protocol.

mod packet;
mod serial_id;
mod status;
mod version;

pub mod proto;

pub use packet::{AddressedPacket, PacketError, CONTROL_CHANNEL, MAX_PAYLOAD};
pub use serial_id::{InvalidSerialId, SerialId};
pub use status::Status;
pub use version::Version;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Well-known control endpoint the daemon binds at startup.
pub const CONTROL_PORT: u16 = 42000;

/// Same, as a ready-to-bind socket address.
pub const CONTROL_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, CONTROL_PORT));

/// How long to wait between unsuccessful attempts to acquire the dongle.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after opening the serial device before talking to it. Some serial
/// drivers need the line to settle after open or the first bytes are lost.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// How long the dongle gets to answer the RPC connect request.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Downtime after an I/O error on the dongle before reacquisition starts.
pub const ERROR_DOWNTIME: Duration = Duration::from_millis(500);

/// Cadence of the keepalive write trap while the dongle is live.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Deadline for the framing handshake with a freshly opened dongle.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Baud rate of the dongle's serial line.
pub const SERIAL_BAUD: u32 = 230_400;

/// Opaque OS-specific serial device handle, e.g. `/dev/ttyACM0` or
/// `\\.\COM3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePath(String);

impl DevicePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
