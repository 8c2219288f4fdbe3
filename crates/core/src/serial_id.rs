use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A robot's serial identifier: exactly four printable ASCII characters.
///
/// Equality and hashing are byte-wise. Construction validates the printable
/// range, so a held `SerialId` is always displayable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialId([u8; 4]);

/// The input was not four printable ASCII characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("serial ids are exactly 4 printable ASCII characters")]
pub struct InvalidSerialId;

impl SerialId {
    /// Reserved identifier addressing the dongle's own control channel.
    pub const DONGLE: SerialId = SerialId(*b"DGLE");

    pub fn new(bytes: [u8; 4]) -> Result<Self, InvalidSerialId> {
        if bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
            Ok(Self(bytes))
        } else {
            Err(InvalidSerialId)
        }
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Validated printable ASCII at construction.
        std::str::from_utf8(&self.0).expect("serial id bytes are ASCII")
    }
}

impl FromStr for SerialId {
    type Err = InvalidSerialId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s.as_bytes().try_into().map_err(|_| InvalidSerialId)?;
        Self::new(bytes)
    }
}

impl fmt::Display for SerialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SerialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialId({})", self.as_str())
    }
}

impl Serialize for SerialId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerialId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <[u8; 4]>::deserialize(deserializer)?;
        SerialId::new(bytes).map_err(serde::de::Error::custom)
    }
}
