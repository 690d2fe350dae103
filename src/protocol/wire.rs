//! Low-level readers for the wire format.
//!
//! All multi-byte integers on the wire are big-endian. These helpers bound-
//! check and surface [`ProtocolError::Truncated`] instead of panicking, so a
//! malformed frame never takes down more than itself.

use byteorder::{BigEndian, ByteOrder};
use chrono::NaiveDate;

use crate::error::{ProtocolError, Result};

/// Read one byte at `at`.
pub fn read_u8(buf: &[u8], at: usize, opcode: u8) -> Result<u8> {
    buf.get(at)
        .copied()
        .ok_or_else(|| truncated(opcode, at + 1, buf.len()))
}

/// Read a big-endian u16 at `at`.
pub fn read_u16(buf: &[u8], at: usize, opcode: u8) -> Result<u16> {
    if buf.len() < at + 2 {
        return Err(truncated(opcode, at + 2, buf.len()));
    }
    Ok(BigEndian::read_u16(&buf[at..at + 2]))
}

/// Read a big-endian 24-bit value at `at` (cell ids are 3 bytes).
pub fn read_u24(buf: &[u8], at: usize, opcode: u8) -> Result<u32> {
    if buf.len() < at + 3 {
        return Err(truncated(opcode, at + 3, buf.len()));
    }
    Ok(BigEndian::read_u24(&buf[at..at + 3]))
}

/// Read a big-endian u32 at `at`.
pub fn read_u32(buf: &[u8], at: usize, opcode: u8) -> Result<u32> {
    if buf.len() < at + 4 {
        return Err(truncated(opcode, at + 4, buf.len()));
    }
    Ok(BigEndian::read_u32(&buf[at..at + 4]))
}

/// Read an exact byte slice `[at, at + len)`.
pub fn read_bytes<'a>(buf: &'a [u8], at: usize, len: usize, opcode: u8) -> Result<&'a [u8]> {
    if buf.len() < at + len {
        return Err(truncated(opcode, at + len, buf.len()));
    }
    Ok(&buf[at..at + len])
}

/// Read the six-byte date-time sextuplet: year-2000, month, day, hour,
/// minute, second, all UTC.
pub fn read_datetime(buf: &[u8], at: usize, opcode: u8) -> Result<chrono::NaiveDateTime> {
    let b = read_bytes(buf, at, 6, opcode)?;
    NaiveDate::from_ymd_opt(2000 + i32::from(b[0]), u32::from(b[1]), u32::from(b[2]))
        .and_then(|d| d.and_hms_opt(u32::from(b[3]), u32::from(b[4]), u32::from(b[5])))
        .ok_or_else(|| {
            ProtocolError::InvalidDateTime(format!(
                "{:02}-{:02}-{:02} {:02}:{:02}:{:02}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ))
            .into()
        })
}

/// Render a 6-byte MAC address as colon-joined uppercase hex pairs.
pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn truncated(opcode: u8, need: usize, have: usize) -> crate::Error {
    ProtocolError::Truncated { opcode, need, have }.into()
}
