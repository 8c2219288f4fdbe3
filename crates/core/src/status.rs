use std::fmt;

use serde::{Deserialize, Serialize};

/// Status codes carried in every control-plane reply and broadcast.
///
/// Low-level transport errors are normalised onto these before they leave
/// the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    CannotOpenDongle,
    DongleNotFound,
    StrangeDongle,
    DongleVersionMismatch,
    PortOutOfRange,
    NoRobotEndpoint,
    BufferOverflow,
    UnregisteredSerialId,
    InvalidSerialId,
    DaemonUnavailable,
    RpcVersionMismatch,
    OperationAborted,
    OtherError,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::CannotOpenDongle => "cannot open dongle",
            Status::DongleNotFound => "dongle not found",
            Status::StrangeDongle => "strange dongle",
            Status::DongleVersionMismatch => "dongle version mismatch",
            Status::PortOutOfRange => "port out of range",
            Status::NoRobotEndpoint => "no robot endpoint",
            Status::BufferOverflow => "buffer overflow",
            Status::UnregisteredSerialId => "unregistered serial id",
            Status::InvalidSerialId => "invalid serial id",
            Status::DaemonUnavailable => "daemon unavailable",
            Status::RpcVersionMismatch => "rpc version mismatch",
            Status::OperationAborted => "operation aborted",
            Status::OtherError => "other error",
        };
        f.write_str(text)
    }
}
