//! Control-plane wire protocol.
//!
//! Every message on a daemon TCP connection is a length-delimited record
//! carrying a bincode-encoded [`Envelope`]: the protocol version triplet, a
//! request id, and a request, reply or broadcast body. The same record
//! framing (without the envelope) carries opaque RPC frames on robot proxy
//! sessions. Over the USB link, envelopes are additionally wrapped in an
//! [`AddressedPacket`](crate::AddressedPacket) header.

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::{SerialId, Status, Version};

/// Version of the daemon's RPC protocol. Peers must match on major.
pub const RPC_VERSION: Version = Version::new(1, 0, 0);

/// Capacity of the null-terminated address field handed to clients. Room
/// for future IPv6 is explicitly not required.
pub const ADDRESS_CAPACITY: usize = 16;

/// Upper bound on a single length-delimited record.
pub const MAX_RECORD: usize = 64 * 1024;

/// A resolved robot proxy endpoint.
///
/// Construction enforces the address-capacity and 16-bit port invariants,
/// so a held `Endpoint` always fits the client-facing result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    address: String,
    port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("address does not fit in {ADDRESS_CAPACITY} bytes")]
    BufferOverflow,
    #[error("port does not fit in 16 bits")]
    PortOutOfRange,
}

impl From<EndpointError> for Status {
    fn from(err: EndpointError) -> Status {
        match err {
            EndpointError::BufferOverflow => Status::BufferOverflow,
            EndpointError::PortOutOfRange => Status::PortOutOfRange,
        }
    }
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u32) -> Result<Self, EndpointError> {
        let address = address.into();
        // One byte is reserved for the terminating null of the C result.
        if address.len() + 1 > ADDRESS_CAPACITY {
            return Err(EndpointError::BufferOverflow);
        }
        let port = u16::try_from(port).map_err(|_| EndpointError::PortOutOfRange)?;
        Ok(Self { address, port })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A robot power-on announcement, re-broadcast to control-plane clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotEvent {
    pub serial_id: SerialId,
    pub firmware_version: Version,
    pub rpc_version: Version,
    pub interface_version: Version,
}

/// Payload of a port-0 announcement from a robot; the serial comes from the
/// packet header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotAnnounce {
    pub firmware_version: Version,
    pub rpc_version: Version,
    pub interface_version: Version,
}

/// Control messages the daemon sends to the dongle on port 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DongleRequest {
    Connect { version: Version },
    Ping { destinations: Vec<SerialId> },
}

/// Control replies from the dongle on port 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DongleReply {
    Connect { status: Status, version: Version },
    Ping { status: Status },
}

/// Requests a control-plane or proxy client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// RPC connect handshake; first message of every session.
    Connect { version: Version },
    ResolveSerialId { serial_id: String },
    SendRobotPing { destinations: Vec<String> },
    CycleDongle { seconds: u32 },
}

/// Replies to [`Request`]s, variant for variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Connect { status: Status, version: Version },
    ResolveSerialId { status: Status, endpoint: Option<Endpoint> },
    SendRobotPing { status: Status },
    CycleDongle { status: Status },
}

/// Unsolicited daemon broadcasts, fanned out to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Broadcast {
    DongleEvent { status: Status },
    RobotEvent(RobotEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Reply(Reply),
    Broadcast(Broadcast),
}

/// One message on a control-plane connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: Version,
    pub id: u32,
    pub body: Body,
}

impl Envelope {
    pub fn request(id: u32, request: Request) -> Self {
        Self { version: RPC_VERSION, id, body: Body::Request(request) }
    }

    pub fn reply(id: u32, reply: Reply) -> Self {
        Self { version: RPC_VERSION, id, body: Body::Reply(reply) }
    }

    pub fn broadcast(broadcast: Broadcast) -> Self {
        Self { version: RPC_VERSION, id: 0, body: Body::Broadcast(broadcast) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("record of {0} bytes exceeds the {MAX_RECORD} byte limit")]
    RecordTooLarge(usize),
    #[error("malformed envelope: {0}")]
    Envelope(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Length-delimited raw records: a little-endian `u32` length prefix
/// followed by that many payload bytes. Robot proxy sessions speak this
/// directly; [`EnvelopeCodec`] layers bincode on top.
#[derive(Debug, Default)]
pub struct RecordCodec;

impl Decoder for RecordCodec {
    type Item = Bytes;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtoError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[..4].try_into().expect("sliced four bytes")) as usize;
        if len > MAX_RECORD {
            return Err(ProtoError::RecordTooLarge(len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for RecordCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtoError> {
        if item.len() > MAX_RECORD {
            return Err(ProtoError::RecordTooLarge(item.len()));
        }
        dst.reserve(4 + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Length-delimited bincode [`Envelope`]s, as spoken on the control plane.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    records: RecordCodec,
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, ProtoError> {
        match self.records.decode(src)? {
            Some(record) => Ok(Some(bincode::deserialize(&record)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let bytes = bincode::serialize(&item)?;
        self.records.encode(Bytes::from(bytes), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_enforces_address_capacity() {
        assert!(Endpoint::new("127.0.0.1", 42000).is_ok());
        // 15 characters plus the terminating null still fits.
        assert!(Endpoint::new("255.255.255.255", 1).is_ok());
        assert_eq!(
            Endpoint::new("fe80::1ff:fe23:4567:890a", 1),
            Err(EndpointError::BufferOverflow)
        );
    }

    #[test]
    fn endpoint_enforces_port_range() {
        assert_eq!(
            Endpoint::new("127.0.0.1", 65536),
            Err(EndpointError::PortOutOfRange)
        );
        assert_eq!(Endpoint::new("127.0.0.1", 65535).unwrap().port(), 65535);
    }

    #[test]
    fn endpoint_errors_map_onto_statuses() {
        assert_eq!(Status::from(EndpointError::BufferOverflow), Status::BufferOverflow);
        assert_eq!(Status::from(EndpointError::PortOutOfRange), Status::PortOutOfRange);
    }

    #[test]
    fn envelope_codec_round_trip() {
        let mut codec = EnvelopeCodec::default();
        let envelope = Envelope::request(
            7,
            Request::ResolveSerialId { serial_id: "ABCD".into() },
        );

        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn envelope_codec_waits_for_full_record() {
        let mut codec = EnvelopeCodec::default();
        let envelope = Envelope::broadcast(Broadcast::DongleEvent { status: Status::Ok });

        let mut full = BytesMut::new();
        codec.encode(envelope.clone(), &mut full).unwrap();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), envelope);
    }

    #[test]
    fn record_codec_rejects_oversized_length() {
        let mut codec = RecordCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_RECORD + 1) as u32);
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtoError::RecordTooLarge(_))
        ));
    }

    #[test]
    fn dongle_control_messages_round_trip() {
        let request = DongleRequest::Ping {
            destinations: vec!["ABCD".parse().unwrap(), "WXYZ".parse().unwrap()],
        };
        let bytes = bincode::serialize(&request).unwrap();
        assert_eq!(bincode::deserialize::<DongleRequest>(&bytes).unwrap(), request);
    }
}
