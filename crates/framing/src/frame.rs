use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use botlink_core::Version;

use crate::link::FramingError;

/// Version of the framing protocol itself, exchanged in the handshake.
pub const FRAMING_VERSION: Version = Version::new(1, 0, 0);

/// Largest payload one frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 1024;

const SYNC1: u8 = 0xf5;
const SYNC2: u8 = 0x9c;

// Header: two sync bytes, kind, seq, little-endian length. A single XOR
// checksum byte trails the payload.
const HEADER_LEN: usize = 6;

const KIND_SYN: u8 = 0x01;
const KIND_SYN_ACK: u8 = 0x02;
const KIND_DATA: u8 = 0x03;
const KIND_ACK: u8 = 0x04;
const KIND_KEEPALIVE: u8 = 0x05;
const KIND_KEEPALIVE_ACK: u8 = 0x06;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Syn { version: Version },
    SynAck { version: Version },
    Data { seq: u8, payload: Bytes },
    Ack { seq: u8 },
    Keepalive,
    KeepaliveAck,
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Syn { .. } => KIND_SYN,
            Frame::SynAck { .. } => KIND_SYN_ACK,
            Frame::Data { .. } => KIND_DATA,
            Frame::Ack { .. } => KIND_ACK,
            Frame::Keepalive => KIND_KEEPALIVE,
            Frame::KeepaliveAck => KIND_KEEPALIVE_ACK,
        }
    }

    fn seq(&self) -> u8 {
        match self {
            Frame::Data { seq, .. } | Frame::Ack { seq } => *seq,
            _ => 0,
        }
    }
}

fn checksum(kind: u8, seq: u8, len: u16, payload: &[u8]) -> u8 {
    let [lo, hi] = len.to_le_bytes();
    payload
        .iter()
        .fold(kind ^ seq ^ lo ^ hi, |acc, byte| acc ^ byte)
}

fn version_payload(version: &Version) -> [u8; 3] {
    [version.major, version.minor, version.patch]
}

fn parse_version(payload: &[u8]) -> Option<Version> {
    match payload {
        [major, minor, patch] => Some(Version::new(*major, *minor, *patch)),
        _ => None,
    }
}

/// Encoder/decoder for [`Frame`]s with resynchronisation.
///
/// The decoder scans for the sync prefix, so garbage on the line (boot
/// noise, a half-transmitted frame after replug) is skipped rather than
/// fatal. Frames with a bad checksum are silently dropped; duplicate
/// suppression happens a layer up.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        loop {
            // Resynchronise on the two sync bytes.
            while !src.is_empty() && src[0] != SYNC1 {
                src.advance(1);
            }
            if src.len() >= 2 && src[1] != SYNC2 {
                src.advance(1);
                continue;
            }
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let kind = src[2];
            let seq = src[3];
            let len = u16::from_le_bytes([src[4], src[5]]) as usize;
            if len > MAX_FRAME_PAYLOAD {
                trace!(len, "discarding frame with absurd length");
                src.advance(2);
                continue;
            }
            if src.len() < HEADER_LEN + len + 1 {
                src.reserve(HEADER_LEN + len + 1 - src.len());
                return Ok(None);
            }

            let raw = src.split_to(HEADER_LEN + len + 1);
            let payload = &raw[HEADER_LEN..HEADER_LEN + len];
            if checksum(kind, seq, len as u16, payload) != raw[HEADER_LEN + len] {
                trace!("discarding frame with bad checksum");
                continue;
            }

            let frame = match kind {
                KIND_SYN => match parse_version(payload) {
                    Some(version) => Frame::Syn { version },
                    None => continue,
                },
                KIND_SYN_ACK => match parse_version(payload) {
                    Some(version) => Frame::SynAck { version },
                    None => continue,
                },
                KIND_DATA => Frame::Data { seq, payload: Bytes::copy_from_slice(payload) },
                KIND_ACK => Frame::Ack { seq },
                KIND_KEEPALIVE => Frame::Keepalive,
                KIND_KEEPALIVE_ACK => Frame::KeepaliveAck,
                other => {
                    trace!(kind = other, "discarding frame of unknown kind");
                    continue;
                }
            };
            return Ok(Some(frame));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FramingError> {
        let version_bytes;
        let payload: &[u8] = match &item {
            Frame::Syn { version } | Frame::SynAck { version } => {
                version_bytes = version_payload(version);
                &version_bytes
            }
            Frame::Data { payload, .. } => payload,
            Frame::Ack { .. } | Frame::Keepalive | Frame::KeepaliveAck => &[],
        };
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FramingError::MessageSize(payload.len()));
        }

        let kind = item.kind();
        let seq = item.seq();
        let len = payload.len() as u16;
        dst.reserve(HEADER_LEN + payload.len() + 1);
        dst.extend_from_slice(&[SYNC1, SYNC2, kind, seq]);
        dst.extend_from_slice(&len.to_le_bytes());
        dst.extend_from_slice(payload);
        dst.extend_from_slice(&[checksum(kind, seq, len, payload)]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn every_frame_kind_round_trips() {
        let frames = [
            Frame::Syn { version: FRAMING_VERSION },
            Frame::SynAck { version: Version::new(2, 1, 0) },
            Frame::Data { seq: 42, payload: Bytes::from_static(b"payload") },
            Frame::Ack { seq: 42 },
            Frame::Keepalive,
            Frame::KeepaliveAck,
        ];
        for frame in frames {
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn decoder_skips_leading_garbage() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x13, 0x37, SYNC1, 0x00]);
        codec
            .encode(Frame::Data { seq: 1, payload: Bytes::from_static(b"x") }, &mut buf)
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Data { seq: 1, payload: Bytes::from_static(b"x") });
    }

    #[test]
    fn decoder_drops_corrupted_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Data { seq: 3, payload: Bytes::from_static(b"abc") }, &mut buf)
            .unwrap();
        let end = buf.len() - 1;
        buf[end] ^= 0xff; // break the checksum
        codec.encode(Frame::Keepalive, &mut buf).unwrap();

        // The corrupted data frame is skipped, the keepalive survives.
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Frame::Keepalive);
    }

    #[test]
    fn decoder_waits_for_partial_frames() {
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec
            .encode(Frame::Data { seq: 9, payload: Bytes::from_static(b"partial") }, &mut full)
            .unwrap();

        let mut buf = BytesMut::new();
        for chunk in full.chunks(3) {
            buf.extend_from_slice(chunk);
            if buf.len() < full.len() {
                assert!(codec.decode(&mut buf).unwrap().is_none());
            }
        }
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Frame::Data { seq: 9, payload: Bytes::from_static(b"partial") }
        );
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let payload = Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]);
        assert!(matches!(
            codec.encode(Frame::Data { seq: 0, payload }, &mut buf),
            Err(FramingError::MessageSize(_))
        ));
    }
}
