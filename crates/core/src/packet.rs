use crate::serial_id::{InvalidSerialId, SerialId};

/// Largest payload a single addressed packet may carry over the radio link.
pub const MAX_PAYLOAD: usize = 512;

/// The reserved port carrying dongle control traffic and robot events.
pub const CONTROL_CHANNEL: u8 = 0;

/// One message on the shared radio link.
///
/// Outbound, `serial_id` names the destination robot; inbound it names the
/// source. Port 0 is the control/event channel, every other port carries an
/// opaque RPC frame for the proxy bound to that robot.
///
/// Wire layout: four serial bytes, one port byte, then the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedPacket {
    pub serial_id: SerialId,
    pub port: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet payload of {0} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    PayloadTooLarge(usize),
    #[error("packet shorter than its header")]
    Truncated,
    #[error(transparent)]
    Serial(#[from] InvalidSerialId),
}

impl AddressedPacket {
    pub fn new(serial_id: SerialId, port: u8, payload: Vec<u8>) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { serial_id, port, payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + self.payload.len());
        bytes.extend_from_slice(self.serial_id.as_bytes());
        bytes.push(self.port);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < 5 {
            return Err(PacketError::Truncated);
        }
        let header: [u8; 4] = bytes[..4].try_into().expect("sliced four bytes");
        let serial_id = SerialId::new(header)?;
        let payload = bytes[5..].to_vec();
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { serial_id, port: bytes[4], payload })
    }
}
