//! Botlink Client
//!
//! Talks to the daemon's control plane: resolve a robot's proxy endpoint,
//! ping robots over the radio, cycle the dongle, and watch the daemon's
//! event broadcasts.

mod client;

pub use client::{DaemonClient, EventStream};

use botlink_core::proto::ProtoError;
use botlink_core::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon is not running (or not reachable) on the control
    /// endpoint.
    #[error("daemon unavailable")]
    DaemonUnavailable,

    /// The daemon answered with a non-OK status.
    #[error("daemon replied: {0}")]
    Status(Status),

    /// A resolve succeeded but carried no endpoint.
    #[error("no robot endpoint")]
    NoRobotEndpoint,

    /// The connection dropped before the reply arrived.
    #[error("connection closed before the reply arrived")]
    ConnectionClosed,

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
