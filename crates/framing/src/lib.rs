//! Botlink Framing
//!
//! Turns a raw byte stream (the dongle's serial line, or an in-memory pipe
//! in tests) into a reliable, message-oriented link: a mandatory handshake,
//! sequence-numbered delivery with retransmission and duplicate
//! suppression, and a keepalive round trip usable as a write trap.

mod frame;
mod link;

pub use frame::{Frame, FrameCodec, FRAMING_VERSION, MAX_FRAME_PAYLOAD};
pub use link::{FramingError, LinkReceiver, LinkSender, ReliableLink};
