//! Core types used throughout slednik.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ProtocolError};

/// Unique identifier for a TCP connection, assigned on accept.
///
/// Connection ids are process-local; device identity comes from the login
/// frame, not from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl ConnId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Device identifier: 15 decimal digits, announced in the login frame as
/// 8 bytes of zero-padded BCD.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Decode from the 8 BCD bytes of a login payload.
    ///
    /// The bytes are hex-encoded, leading zeros stripped, and the result
    /// truncated to 15 characters.
    pub fn from_bcd(bytes: &[u8; 8]) -> Self {
        let digits = hex::encode(bytes);
        let trimmed = digits.trim_start_matches('0');
        let mut id = trimmed.to_string();
        id.truncate(15);
        Self(id)
    }

    /// Encode back to 8 zero-padded BCD bytes.
    pub fn to_bcd(&self) -> std::result::Result<[u8; 8], Error> {
        let padded = format!("{:0>16}", self.0);
        let mut out = [0u8; 8];
        hex::decode_to_slice(&padded, &mut out)
            .map_err(|_| ProtocolError::InvalidIdentifier(self.0.clone()))?;
        Ok(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 15 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidIdentifier(s.to_string()).into());
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 16-bit counter carried in every frame.
///
/// Devices echo it verbatim in acknowledgments, which is what lets the
/// server correlate command responses with in-flight commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sequence(pub u16);

impl Sequence {
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<u16> for Sequence {
    fn from(v: u16) -> Self {
        Self(v)
    }
}
