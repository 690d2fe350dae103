//! Wire protocol for Concox V5 trackers.
//!
//! Defines the dual framing, the CRC, the payload parsers and the outbound
//! builders.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Start (2) │ Length (1|2) │ Opcode (1) │ Payload ...              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Sequence (2) │ CRC-ITU (2) │ 0x0D 0x0A                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Start `0x7878` takes a one-byte length, start `0x7979` a two-byte
//! big-endian length. The length counts opcode through CRC inclusive; the
//! CRC covers the length field through the sequence inclusive.

pub mod builder;
pub mod crc;
pub mod frame;
pub mod message;
pub mod wire;

pub use builder::{build_ack, build_file_ack, build_module_ack, build_time_response, encode_command};
pub use crc::crc as crc_itu;
pub use frame::{FrameCodec, RawFrame};
pub use message::Message;

/// First byte of the short start marker `0x7878`.
pub const START_SHORT: u8 = 0x78;

/// First byte of the long start marker `0x7979`.
pub const START_LONG: u8 = 0x79;

/// Every frame ends with CR LF.
pub const TERMINATOR: [u8; 2] = [0x0D, 0x0A];

/// Protocol opcodes, inbound unless noted.
pub mod opcode {
    /// Login announcing the BCD device identifier.
    pub const LOGIN: u8 = 0x01;
    /// Heartbeat with terminal status, battery and GSM level.
    pub const HEARTBEAT: u8 = 0x13;
    /// Command response, JM01 flavor (no server-flag field).
    pub const COMMAND_RESPONSE_JM01: u8 = 0x15;
    /// Cell-tower alarm without a date prefix.
    pub const LBS_ALARM: u8 = 0x19;
    /// Command response with server-flag echo.
    pub const COMMAND_RESPONSE: u8 = 0x21;
    /// GPS position report.
    pub const POSITION: u8 = 0x22;
    /// Alarm with date prefix.
    pub const ALARM: u8 = 0x26;
    /// Alarm, HVT001 flavor, optionally carrying a GPS block.
    pub const ALARM_EXTENDED: u8 = 0x27;
    /// Multi-base LBS extension: main cell plus six neighbors.
    pub const LBS_EXTENSION: u8 = 0x28;
    /// WiFi access-point scan on top of the LBS block.
    pub const WIFI_SCAN: u8 = 0x2C;
    /// Outbound operator command (server to device).
    pub const COMMAND: u8 = 0x80;
    /// Time calibration request; the response carries current UTC.
    pub const TIME_REQUEST: u8 = 0x8A;
    /// Large file transfer chunk, always long-framed.
    pub const FILE_TRANSFER: u8 = 0x8D;
    /// Information transmission with sub-opcodes.
    pub const INFO_TRANSMISSION: u8 = 0x94;
    /// External device passthrough data.
    pub const EXTERNAL_DATA: u8 = 0x9B;
    /// External module transmission with module id.
    pub const MODULE_DATA: u8 = 0x9C;
}
