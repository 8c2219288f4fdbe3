//! Botlink Daemon
//!
//! The transport multiplexer between local robot clients and the fleet of
//! wireless robots behind one USB radio dongle.
//!
//! ## Components
//!
//! - **Lifecycle supervisor**: acquires the dongle (find device, open,
//!   settle, framing handshake, RPC connect), keeps it live with a read
//!   trap and a keepalive write trap, and reacquires after errors. All
//!   shared daemon state is owned by this one task; everything else talks
//!   to it through a command channel.
//! - **Router**: tags outbound RPC frames with their destination serial and
//!   demultiplexes inbound packets to the robot proxies, broadcasting
//!   port-0 traffic as robot events.
//! - **Robot proxies**: one local TCP endpoint per resolved robot, each
//!   bridging a client RPC session onto the shared link.
//! - **Control server**: the well-known TCP endpoint exposing
//!   `resolveSerialId`, `sendRobotPing`, `cycleDongle` and the
//!   `dongleEvent`/`robotEvent` broadcasts.

pub mod device;
pub mod lifecycle;
pub mod proxy;
pub mod router;
pub mod server;
pub mod service;
pub mod testing;

pub use device::{find_dongle_path, DongleIo, DongleStream, UsbDongleIo};
pub use lifecycle::DongleState;
pub use proxy::ProxyState;
pub use server::ControlServer;
pub use service::DaemonService;

use botlink_core::proto::ProtoError;
use botlink_framing::FramingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("link error: {0}")]
    Link(#[from] FramingError),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
