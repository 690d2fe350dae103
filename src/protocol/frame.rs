//! Frame extraction from the raw TCP byte stream.
//!
//! Devices send two framing variants: short frames start `0x7878` with a
//! one-byte length, long frames start `0x7979` with a two-byte big-endian
//! length. The length counts opcode through CRC inclusive; every frame ends
//! with `0x0D 0x0A`. Streams arrive arbitrarily fragmented and occasionally
//! carry garbage between frames, so the decoder resynchronises by scanning
//! for the next plausible start byte.

use bytes::{Buf, Bytes, BytesMut};
use byteorder::{BigEndian, ByteOrder};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{info, warn};

use super::{crc::crc, START_LONG, START_SHORT, TERMINATOR};
use crate::error::{ProtocolError, Result};
use crate::types::Sequence;
use crate::MAX_RECV_BUFFER;

/// Smallest declared length that can hold opcode + sequence + CRC.
const MIN_DECLARED_LEN: usize = 5;

/// One complete frame as cut from the stream, terminator included.
#[derive(Debug, Clone)]
pub struct RawFrame {
    bytes: Bytes,
    header_len: usize,
    long: bool,
}

impl RawFrame {
    fn new(bytes: Bytes, header_len: usize, long: bool) -> Self {
        Self {
            bytes,
            header_len,
            long,
        }
    }

    /// Build a frame directly from a contiguous byte slice, for tests and
    /// the `decode` CLI helper. The slice must hold exactly one frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(data);
        match scan(&buf)? {
            FrameStep::Frame {
                total,
                header_len,
                long,
            } if total == data.len() => {
                Ok(Self::new(buf.split_to(total).freeze(), header_len, long))
            }
            _ => Err(ProtocolError::Malformed("not exactly one frame".into()).into()),
        }
    }

    /// The frame opcode.
    pub fn opcode(&self) -> u8 {
        self.bytes[self.header_len]
    }

    /// Opcode-specific payload: everything between the opcode and the
    /// sequence.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.header_len + 1..self.bytes.len() - 6]
    }

    /// The 16-bit sequence, read from `frame[len-6..len-4]`.
    pub fn sequence(&self) -> Sequence {
        let at = self.bytes.len() - 6;
        Sequence(BigEndian::read_u16(&self.bytes[at..at + 2]))
    }

    /// The CRC the frame carries.
    pub fn crc_carried(&self) -> u16 {
        let at = self.bytes.len() - 4;
        BigEndian::read_u16(&self.bytes[at..at + 2])
    }

    /// The CRC the frame should carry: over the length field through the
    /// sequence inclusive.
    pub fn crc_computed(&self) -> u16 {
        crc(&self.bytes[2..self.bytes.len() - 4])
    }

    /// Verify the carried CRC. Inbound handling logs a mismatch and parses
    /// anyway; the check is never fatal.
    pub fn verify_crc(&self) -> std::result::Result<(), ProtocolError> {
        let computed = self.crc_computed();
        let carried = self.crc_carried();
        if computed == carried {
            Ok(())
        } else {
            Err(ProtocolError::CrcMismatch { computed, carried })
        }
    }

    /// Whether the trailing two bytes are the `0x0D 0x0A` terminator.
    pub fn terminator_ok(&self) -> bool {
        self.bytes[self.bytes.len() - 2..] == TERMINATOR
    }

    /// Long (`0x7979`) framing?
    pub fn is_long(&self) -> bool {
        self.long
    }

    /// Total frame size including markers and terminator.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// The whole frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Outcome of one scan over the buffer head.
#[derive(Debug, PartialEq, Eq)]
enum FrameStep {
    /// Not enough bytes to decide; wait for more.
    NeedMore,
    /// Invalid start marker: drop `skip` bytes up to the next plausible
    /// start (or the whole buffer).
    Resync { skip: usize },
    /// Structurally broken frame: drop exactly these bytes and continue.
    Discard { skip: usize, reason: &'static str },
    /// A complete frame of `total` bytes is available.
    Frame {
        total: usize,
        header_len: usize,
        long: bool,
    },
}

/// Pure scan step over the buffer head: the §4.2-shaped state machine,
/// kept free of I/O so resynchronisation is testable byte-by-byte.
fn scan(buf: &[u8]) -> Result<FrameStep> {
    if buf.len() < 5 {
        return Ok(FrameStep::NeedMore);
    }

    let (header_len, declared, long) = if buf[0] == START_SHORT && buf[1] == START_SHORT {
        (3usize, usize::from(buf[2]), false)
    } else if buf[0] == START_LONG && buf[1] == START_LONG {
        if buf.len() < 6 {
            return Ok(FrameStep::NeedMore);
        }
        (4usize, usize::from(BigEndian::read_u16(&buf[2..4])), true)
    } else {
        // Skip to the next byte that could begin a start marker.
        let skip = buf[1..]
            .iter()
            .position(|&b| b == START_SHORT || b == START_LONG)
            .map_or(buf.len(), |p| p + 1);
        return Ok(FrameStep::Resync { skip });
    };

    let total = header_len + declared + 2;
    if total > MAX_RECV_BUFFER {
        return Err(ProtocolError::FrameTooLarge {
            declared: total,
            max: MAX_RECV_BUFFER,
        }
        .into());
    }
    if declared < MIN_DECLARED_LEN {
        return Ok(FrameStep::Discard {
            skip: total.min(buf.len()),
            reason: "declared length below opcode+sequence+crc minimum",
        });
    }
    if buf.len() < total {
        return Ok(FrameStep::NeedMore);
    }

    Ok(FrameStep::Frame {
        total,
        header_len,
        long,
    })
}

/// Tokio codec for device frames.
///
/// Decoding loops over [`scan`] until a full frame is available, advancing
/// past garbage. A mismatched terminator is logged and tolerated; an
/// oversize declared length is the one decode error that tears the
/// connection down.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match scan(src)? {
                FrameStep::NeedMore => return Ok(None),
                FrameStep::Resync { skip } => {
                    info!(skipped = skip, "resync");
                    src.advance(skip);
                }
                FrameStep::Discard { skip, reason } => {
                    warn!(skipped = skip, reason, "dropping malformed frame");
                    src.advance(skip);
                }
                FrameStep::Frame {
                    total,
                    header_len,
                    long,
                } => {
                    let frame = RawFrame::new(src.split_to(total).freeze(), header_len, long);
                    if !frame.terminator_ok() {
                        warn!(
                            opcode = format_args!("{:#04x}", frame.opcode()),
                            "frame terminator is not 0d0a, accepting anyway"
                        );
                    }
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
