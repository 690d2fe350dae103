//! Payload parsers: one per opcode, dispatched by exhaustive match.
//!
//! [`Message::parse`] turns a [`RawFrame`] into the tagged union below.
//! Parsers are pure; session side effects (identity binding, pending-command
//! correlation) live in the server module. Position references follow the
//! wire layout: offsets are relative to the first payload byte, just past
//! the opcode.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use super::frame::RawFrame;
use super::opcode;
use super::wire::{
    format_mac, read_bytes, read_datetime, read_u16, read_u24, read_u32, read_u8,
};
use crate::error::{ProtocolError, Result};
use crate::types::DeviceId;

/// Divisor turning the raw 4-byte coordinate into decimal degrees.
const COORD_DIVISOR: f64 = 1_800_000.0;

/// Everything a device can say, one variant per opcode.
#[derive(Debug, Clone, Serialize)]
pub enum Message {
    /// 0x01
    Login(Login),
    /// 0x13
    Heartbeat(Heartbeat),
    /// 0x15
    CommandResponseJm01(CommandResponse),
    /// 0x19
    LbsAlarm(LbsAlarm),
    /// 0x21
    CommandResponse(CommandResponse),
    /// 0x22
    Position(Position),
    /// 0x26
    Alarm(Alarm),
    /// 0x27
    AlarmExtended(Alarm),
    /// 0x28
    LbsExtension(LbsExtension),
    /// 0x2C
    WifiScan(WifiScan),
    /// 0x8A — empty payload, answered with current UTC
    TimeRequest,
    /// 0x8D
    FileTransfer(FileChunk),
    /// 0x94
    InfoTransmission(InfoPayload),
    /// 0x9B
    ExternalData(ExternalData),
    /// 0x9C
    ModuleData(ModuleData),
    /// Anything else: kept raw, logged, never fatal
    Unknown { opcode: u8, payload: Vec<u8> },
}

impl Message {
    /// Parse one frame into its payload value.
    pub fn parse(frame: &RawFrame) -> Result<Self> {
        let op = frame.opcode();
        let payload = frame.payload();
        match op {
            opcode::LOGIN => parse_login(payload).map(Message::Login),
            opcode::HEARTBEAT => parse_heartbeat(payload).map(Message::Heartbeat),
            opcode::COMMAND_RESPONSE_JM01 => {
                parse_command_response(payload, frame.is_long(), false)
                    .map(Message::CommandResponseJm01)
            }
            opcode::LBS_ALARM => parse_lbs_alarm(payload).map(Message::LbsAlarm),
            opcode::COMMAND_RESPONSE => parse_command_response(payload, frame.is_long(), true)
                .map(Message::CommandResponse),
            opcode::POSITION => parse_position(payload).map(Message::Position),
            opcode::ALARM => parse_alarm(payload).map(Message::Alarm),
            opcode::ALARM_EXTENDED => parse_alarm_extended(payload).map(Message::AlarmExtended),
            opcode::LBS_EXTENSION => parse_lbs_extension(payload).map(Message::LbsExtension),
            opcode::WIFI_SCAN => parse_wifi_scan(payload).map(Message::WifiScan),
            opcode::TIME_REQUEST => Ok(Message::TimeRequest),
            opcode::FILE_TRANSFER => parse_file_chunk(payload).map(Message::FileTransfer),
            opcode::INFO_TRANSMISSION => parse_info(payload).map(Message::InfoTransmission),
            opcode::EXTERNAL_DATA => parse_external(payload).map(Message::ExternalData),
            opcode::MODULE_DATA => parse_module(payload).map(Message::ModuleData),
            _ => Ok(Message::Unknown {
                opcode: op,
                payload: payload.to_vec(),
            }),
        }
    }

    /// Short name used in log events.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Login(_) => "login",
            Message::Heartbeat(_) => "heartbeat",
            Message::CommandResponseJm01(_) | Message::CommandResponse(_) => "command_response",
            Message::LbsAlarm(_) => "lbs_alarm",
            Message::Position(_) => "gps_location",
            Message::Alarm(_) | Message::AlarmExtended(_) => "alarm",
            Message::LbsExtension(_) => "lbs_extension",
            Message::WifiScan(_) => "wifi_scan",
            Message::TimeRequest => "time_request",
            Message::FileTransfer(_) => "file_transfer",
            Message::InfoTransmission(_) => "info_transmission",
            Message::ExternalData(_) => "external_data",
            Message::ModuleData(_) => "module_data",
            Message::Unknown { .. } => "unknown",
        }
    }
}

// ---------------------------------------------------------------------------
// Login (0x01)
// ---------------------------------------------------------------------------

/// Device identity announcement.
#[derive(Debug, Clone, Serialize)]
pub struct Login {
    pub device_id: DeviceId,
    /// Model/type identification word, when the device sends one.
    pub model: Option<u16>,
}

fn parse_login(payload: &[u8]) -> Result<Login> {
    let bcd: [u8; 8] = read_bytes(payload, 0, 8, opcode::LOGIN)?
        .try_into()
        .expect("slice length checked");
    let model = if payload.len() >= 10 {
        Some(read_u16(payload, 8, opcode::LOGIN)?)
    } else {
        None
    };
    Ok(Login {
        device_id: DeviceId::from_bcd(&bcd),
        model,
    })
}

// ---------------------------------------------------------------------------
// Heartbeat (0x13)
// ---------------------------------------------------------------------------

/// Terminal-information bit field sent in heartbeats and LBS alarms.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TerminalInfo {
    /// bit7: fuel/electricity relay currently cut
    pub oil_disconnected: bool,
    /// bit6: GPS tracking enabled
    pub gps_tracking: bool,
    /// bit2: charging from external power
    pub charging: bool,
    /// bit1: ACC (ignition) line high
    pub acc_high: bool,
    /// bit0: anti-theft defense armed
    pub defense_active: bool,
    pub raw: u8,
}

impl TerminalInfo {
    pub fn from_byte(raw: u8) -> Self {
        Self {
            oil_disconnected: raw & 0x80 != 0,
            gps_tracking: raw & 0x40 != 0,
            charging: raw & 0x04 != 0,
            acc_high: raw & 0x02 != 0,
            defense_active: raw & 0x01 != 0,
            raw,
        }
    }
}

/// Battery level reported in heartbeats, 0 through 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatteryLevel {
    NoPower,
    ExtremelyLow,
    VeryLow,
    Low,
    Medium,
    High,
    Full,
    /// Off-table value, kept raw.
    Unknown(u8),
}

impl BatteryLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NoPower,
            1 => Self::ExtremelyLow,
            2 => Self::VeryLow,
            3 => Self::Low,
            4 => Self::Medium,
            5 => Self::High,
            6 => Self::Full,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPower => write!(f, "No Power"),
            Self::ExtremelyLow => write!(f, "Extremely Low"),
            Self::VeryLow => write!(f, "Very Low"),
            Self::Low => write!(f, "Low"),
            Self::Medium => write!(f, "Medium"),
            Self::High => write!(f, "High"),
            Self::Full => write!(f, "Full"),
            Self::Unknown(v) => write!(f, "Unknown({v})"),
        }
    }
}

/// GSM signal strength, 0 through 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GsmSignal {
    NoSignal,
    ExtremelyWeak,
    Weak,
    Good,
    Strong,
    Unknown(u8),
}

impl GsmSignal {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NoSignal,
            1 => Self::ExtremelyWeak,
            2 => Self::Weak,
            3 => Self::Good,
            4 => Self::Strong,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for GsmSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSignal => write!(f, "No Signal"),
            Self::ExtremelyWeak => write!(f, "Extremely Weak"),
            Self::Weak => write!(f, "Weak"),
            Self::Good => write!(f, "Good"),
            Self::Strong => write!(f, "Strong"),
            Self::Unknown(v) => write!(f, "Unknown({v})"),
        }
    }
}

/// Periodic status report.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub terminal: TerminalInfo,
    pub battery: BatteryLevel,
    pub signal: GsmSignal,
    pub language: Option<u16>,
}

fn parse_heartbeat(payload: &[u8]) -> Result<Heartbeat> {
    let terminal = TerminalInfo::from_byte(read_u8(payload, 0, opcode::HEARTBEAT)?);
    let battery = BatteryLevel::from_u8(read_u8(payload, 1, opcode::HEARTBEAT)?);
    let signal = GsmSignal::from_u8(read_u8(payload, 2, opcode::HEARTBEAT)?);
    let language = if payload.len() >= 5 {
        Some(read_u16(payload, 3, opcode::HEARTBEAT)?)
    } else {
        None
    };
    Ok(Heartbeat {
        terminal,
        battery,
        signal,
        language,
    })
}

// ---------------------------------------------------------------------------
// GPS position (0x22)
// ---------------------------------------------------------------------------

/// The GNSS core shared by position reports and extended alarms.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GpsFix {
    pub satellites: u8,
    /// Decimal degrees, negative south.
    pub latitude: f64,
    /// Decimal degrees, negative west.
    pub longitude: f64,
    pub speed_kmh: u8,
    /// 10-bit course as transmitted (0..=1023); values above 359 are kept.
    pub course: u16,
    /// GPS has a fix and the coordinates are plausible.
    pub positioned: bool,
    /// Differential (as opposed to real-time) positioning.
    pub differential: bool,
}

/// Serving cell attached to position reports.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CellTower {
    pub mcc: u16,
    pub mnc: u8,
    pub lac: u16,
    pub cell_id: u32,
}

/// Why the device uploaded this position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadMode {
    Time,
    Distance,
    Inflection,
    Acc,
    Reupload,
    NetworkRecovery,
    PowerOn,
    GpsDup,
    Other(u8),
}

impl UploadMode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::Time,
            0x01 => Self::Distance,
            0x02 => Self::Inflection,
            0x03 => Self::Acc,
            0x04 => Self::Reupload,
            0x05 => Self::NetworkRecovery,
            0x08 => Self::PowerOn,
            0x0E => Self::GpsDup,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time => write!(f, "Time"),
            Self::Distance => write!(f, "Distance"),
            Self::Inflection => write!(f, "Inflection"),
            Self::Acc => write!(f, "ACC"),
            Self::Reupload => write!(f, "Re-upload"),
            Self::NetworkRecovery => write!(f, "Network Recovery"),
            Self::PowerOn => write!(f, "Power On"),
            Self::GpsDup => write!(f, "GPS Dup"),
            Self::Other(v) => write!(f, "Other({v:#04x})"),
        }
    }
}

/// Full position report.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub time: NaiveDateTime,
    pub fix: GpsFix,
    pub cell: CellTower,
    pub acc_on: Option<bool>,
    pub upload_mode: Option<UploadMode>,
    pub gps_reupload: Option<bool>,
    /// Odometer in meters, trailing the frame when the device reports one.
    pub odometer_m: Option<u32>,
}

/// Read the 12-byte GNSS block starting at the gps-info byte.
fn read_gps_fix(payload: &[u8], at: usize, op: u8) -> Result<GpsFix> {
    let gps_info = read_u8(payload, at, op)?;
    let satellites = gps_info & 0x0F;
    let lat_raw = read_u32(payload, at + 1, op)?;
    let lon_raw = read_u32(payload, at + 5, op)?;
    let speed_kmh = read_u8(payload, at + 9, op)?;
    let b1 = read_u8(payload, at + 10, op)?;
    let b2 = read_u8(payload, at + 11, op)?;

    let course = (u16::from(b1 & 0x03) << 8) | u16::from(b2);
    let mut positioned = b1 & 0x10 != 0;
    let differential = b1 & 0x20 != 0;

    // Quadrant bits: bit2 set is north (positive), bit3 set is west
    // (negative).
    let mut latitude = f64::from(lat_raw) / COORD_DIVISOR;
    if b1 & 0x04 == 0 {
        latitude = -latitude;
    }
    let mut longitude = f64::from(lon_raw) / COORD_DIVISOR;
    if b1 & 0x08 != 0 {
        longitude = -longitude;
    }

    // Coordinates outside the valid domain demote the fix.
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        positioned = false;
    }

    Ok(GpsFix {
        satellites,
        latitude,
        longitude,
        speed_kmh,
        course,
        positioned,
        differential,
    })
}

fn parse_position(payload: &[u8]) -> Result<Position> {
    let op = opcode::POSITION;
    let time = read_datetime(payload, 0, op)?;
    let fix = read_gps_fix(payload, 6, op)?;
    let cell = CellTower {
        mcc: read_u16(payload, 18, op)?,
        mnc: read_u8(payload, 20, op)?,
        lac: read_u16(payload, 21, op)?,
        cell_id: read_u24(payload, 23, op)?,
    };

    // Trailing fields are optional; presence is declared purely by length.
    let acc_on = payload.get(26).map(|&b| b != 0);
    let upload_mode = payload.get(27).map(|&b| UploadMode::from_u8(b));
    let gps_reupload = payload.get(28).map(|&b| b != 0);

    // The odometer sits immediately before the sequence, i.e. in the last
    // four payload bytes, and only exists when the frame is long enough to
    // hold it past the optional block.
    let odometer_m = if payload.len() >= 33 {
        Some(read_u32(payload, payload.len() - 4, op)?)
    } else {
        None
    };

    Ok(Position {
        time,
        fix,
        cell,
        acc_on,
        upload_mode,
        gps_reupload,
        odometer_m,
    })
}

// ---------------------------------------------------------------------------
// Alarms (0x26, 0x27, 0x19)
// ---------------------------------------------------------------------------

/// Alarm cause codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmKind {
    Sos,
    PowerCut,
    Vibration,
    EnterFence,
    ExitFence,
    OverSpeed,
    ExternalLowBattery,
    Tamper,
    InternalLowBattery,
    AccOn,
    AccOff,
    Other(u8),
}

impl AlarmKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x01 => Self::Sos,
            0x02 => Self::PowerCut,
            0x03 => Self::Vibration,
            0x04 => Self::EnterFence,
            0x05 => Self::ExitFence,
            0x06 => Self::OverSpeed,
            0x0E => Self::ExternalLowBattery,
            0x13 => Self::Tamper,
            0x19 => Self::InternalLowBattery,
            0xFE => Self::AccOn,
            0xFF => Self::AccOff,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sos => write!(f, "SOS Alarm"),
            Self::PowerCut => write!(f, "Power Cut Alarm"),
            Self::Vibration => write!(f, "Vibration Alarm"),
            Self::EnterFence => write!(f, "Enter Fence Alarm"),
            Self::ExitFence => write!(f, "Exit Fence Alarm"),
            Self::OverSpeed => write!(f, "Over Speed Alarm"),
            Self::ExternalLowBattery => write!(f, "External Low Battery Alarm"),
            Self::Tamper => write!(f, "Tamper Alarm"),
            Self::InternalLowBattery => write!(f, "Internal Low Battery Alarm"),
            Self::AccOn => write!(f, "ACC On"),
            Self::AccOff => write!(f, "ACC Off"),
            Self::Other(v) => write!(f, "Alarm({v:#04x})"),
        }
    }
}

/// Dated alarm, with a GNSS block on the HVT001 flavor when present.
#[derive(Debug, Clone, Serialize)]
pub struct Alarm {
    pub time: NaiveDateTime,
    pub kind: AlarmKind,
    pub fix: Option<GpsFix>,
}

/// The alarm code sits four bytes before the sequence, i.e. in the last
/// four payload bytes.
fn alarm_code(payload: &[u8], op: u8) -> Result<AlarmKind> {
    if payload.len() < 4 {
        return Err(ProtocolError::Truncated {
            opcode: op,
            need: 4,
            have: payload.len(),
        }
        .into());
    }
    Ok(AlarmKind::from_u8(payload[payload.len() - 4]))
}

fn parse_alarm(payload: &[u8]) -> Result<Alarm> {
    let op = opcode::ALARM;
    Ok(Alarm {
        time: read_datetime(payload, 0, op)?,
        kind: alarm_code(payload, op)?,
        fix: None,
    })
}

fn parse_alarm_extended(payload: &[u8]) -> Result<Alarm> {
    let op = opcode::ALARM_EXTENDED;
    let time = read_datetime(payload, 0, op)?;
    let kind = alarm_code(payload, op)?;

    // GNSS block present only when the info byte announces satellites and
    // the buffer actually extends over the 12-byte block.
    let fix = match payload.get(6) {
        Some(info) if info & 0x0F > 0 && payload.len() >= 18 => {
            Some(read_gps_fix(payload, 6, op)?)
        }
        _ => None,
    };

    Ok(Alarm { time, kind, fix })
}

/// Cell-tower alarm, no date prefix.
#[derive(Debug, Clone, Serialize)]
pub struct LbsAlarm {
    pub cell: CellTower,
    pub terminal: TerminalInfo,
    pub voltage: BatteryLevel,
    pub signal: GsmSignal,
    pub kind: AlarmKind,
    pub language: u8,
}

fn parse_lbs_alarm(payload: &[u8]) -> Result<LbsAlarm> {
    let op = opcode::LBS_ALARM;
    Ok(LbsAlarm {
        cell: CellTower {
            mcc: read_u16(payload, 0, op)?,
            mnc: read_u8(payload, 2, op)?,
            lac: read_u16(payload, 3, op)?,
            cell_id: read_u24(payload, 5, op)?,
        },
        terminal: TerminalInfo::from_byte(read_u8(payload, 8, op)?),
        voltage: BatteryLevel::from_u8(read_u8(payload, 9, op)?),
        signal: GsmSignal::from_u8(read_u8(payload, 10, op)?),
        kind: AlarmKind::from_u8(read_u8(payload, 11, op)?),
        language: read_u8(payload, 12, op)?,
    })
}

// ---------------------------------------------------------------------------
// Multi-base LBS (0x28) and WiFi (0x2C)
// ---------------------------------------------------------------------------

/// The serving cell with its signal strength.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MainCell {
    pub mcc: u16,
    pub mnc: u8,
    pub lac: u16,
    pub cell_id: u32,
    pub rssi: u8,
}

/// One of the six neighbor cells.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NeighborCell {
    pub lac: u16,
    pub cell_id: u32,
    pub rssi: u8,
}

/// Main cell plus exactly six neighbors: the 45-byte block shared by the
/// LBS extension and WiFi reports.
#[derive(Debug, Clone, Serialize)]
pub struct CellEnvironment {
    pub main: MainCell,
    pub neighbors: Vec<NeighborCell>,
}

fn read_cell_environment(payload: &[u8], at: usize, op: u8) -> Result<CellEnvironment> {
    let main = MainCell {
        mcc: read_u16(payload, at, op)?,
        mnc: read_u8(payload, at + 2, op)?,
        lac: read_u16(payload, at + 3, op)?,
        cell_id: read_u24(payload, at + 5, op)?,
        rssi: read_u8(payload, at + 8, op)?,
    };
    let mut neighbors = Vec::with_capacity(6);
    for i in 0..6 {
        let base = at + 9 + i * 6;
        neighbors.push(NeighborCell {
            lac: read_u16(payload, base, op)?,
            cell_id: read_u24(payload, base + 2, op)?,
            rssi: read_u8(payload, base + 5, op)?,
        });
    }
    Ok(CellEnvironment { main, neighbors })
}

/// Multi-base cell report.
#[derive(Debug, Clone, Serialize)]
pub struct LbsExtension {
    pub time: NaiveDateTime,
    pub cells: CellEnvironment,
    pub timing_advance: u8,
    pub language: u16,
}

fn parse_lbs_extension(payload: &[u8]) -> Result<LbsExtension> {
    let op = opcode::LBS_EXTENSION;
    Ok(LbsExtension {
        time: read_datetime(payload, 0, op)?,
        cells: read_cell_environment(payload, 6, op)?,
        timing_advance: read_u8(payload, 51, op)?,
        language: read_u16(payload, 52, op)?,
    })
}

/// One scanned access point.
#[derive(Debug, Clone, Serialize)]
pub struct WifiAp {
    /// Colon-joined uppercase hex pairs.
    pub mac: String,
    /// Signal strength, two's-complement over one byte.
    pub strength: i8,
    pub ssid: String,
}

/// WiFi scan on top of the cell environment.
#[derive(Debug, Clone, Serialize)]
pub struct WifiScan {
    pub time: NaiveDateTime,
    pub cells: CellEnvironment,
    pub time_leads: u8,
    pub aps: Vec<WifiAp>,
}

fn parse_wifi_scan(payload: &[u8]) -> Result<WifiScan> {
    let op = opcode::WIFI_SCAN;
    let time = read_datetime(payload, 0, op)?;
    let cells = read_cell_environment(payload, 6, op)?;
    let time_leads = read_u8(payload, 51, op)?;
    let ap_count = read_u8(payload, 52, op)?;

    let mut aps = Vec::with_capacity(usize::from(ap_count));
    let mut at = 53;
    for _ in 0..ap_count {
        let mac = format_mac(read_bytes(payload, at, 6, op)?);
        let strength = read_u8(payload, at + 6, op)? as i8;
        let ssid_len = usize::from(read_u8(payload, at + 7, op)?);
        let ssid = String::from_utf8_lossy(read_bytes(payload, at + 8, ssid_len, op)?).into_owned();
        at += 8 + ssid_len;
        aps.push(WifiAp {
            mac,
            strength,
            ssid,
        });
    }

    Ok(WifiScan {
        time,
        cells,
        time_leads,
        aps,
    })
}

// ---------------------------------------------------------------------------
// Command responses (0x21, 0x15)
// ---------------------------------------------------------------------------

/// Device reply to an operator command, correlated by sequence.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    /// Server-flag echo; absent on the JM01 flavor.
    pub server_flag: Option<u32>,
    pub text: String,
}

fn parse_command_response(payload: &[u8], long: bool, with_flag: bool) -> Result<CommandResponse> {
    let op = if with_flag {
        opcode::COMMAND_RESPONSE
    } else {
        opcode::COMMAND_RESPONSE_JM01
    };

    let mut at = 0;
    let server_flag = if with_flag {
        let flag = read_u32(payload, 0, op)?;
        at = 4;
        Some(flag)
    } else {
        None
    };

    // Short frames declare the response length in one byte, long frames in
    // two; the text is additionally bounded by what the frame holds.
    let declared = if long {
        let v = usize::from(read_u16(payload, at, op)?);
        at += 2;
        v
    } else {
        let v = usize::from(read_u8(payload, at, op)?);
        at += 1;
        v
    };
    let avail = payload.len().saturating_sub(at);
    let raw = read_bytes(payload, at, declared.min(avail), op)?;

    let text: String = String::from_utf8_lossy(raw)
        .chars()
        .filter(|&c| c != '\0')
        .collect();
    Ok(CommandResponse {
        server_flag,
        text: text.trim_end().to_string(),
    })
}

// ---------------------------------------------------------------------------
// File transfer (0x8D)
// ---------------------------------------------------------------------------

/// How a chunk's integrity is declared.
#[derive(Debug, Clone, Serialize)]
pub enum ChunkCheck {
    Crc(u16),
    Md5(#[serde(with = "hex::serde")] [u8; 16]),
}

/// Chunk-specific trailer.
#[derive(Debug, Clone, Serialize)]
pub enum ChunkTag {
    /// File types 0x00 and 0x02 stamp a capture time.
    Timestamp(NaiveDateTime),
    /// File type 0x01 stamps a serial.
    Serial(u16),
    /// Unspecified file types carry no defined trailer.
    None,
}

/// One chunk of a device-to-server file transfer. Always long-framed.
#[derive(Debug, Clone, Serialize)]
pub struct FileChunk {
    pub file_type: u8,
    pub file_length: u32,
    pub check: ChunkCheck,
    pub start: u32,
    pub content: Vec<u8>,
    pub tag: ChunkTag,
}

impl FileChunk {
    /// Whether this chunk ends the file.
    pub fn is_complete(&self) -> bool {
        u64::from(self.start) + self.content.len() as u64 >= u64::from(self.file_length)
    }

    /// Check the chunk content against its declared CRC or MD5 digest.
    pub fn verify(&self) -> bool {
        match &self.check {
            ChunkCheck::Crc(expected) => super::crc::crc(&self.content) == *expected,
            ChunkCheck::Md5(expected) => {
                use md5::{Digest, Md5};
                // Digests compare as bytes; hex-case differences cannot
                // arise here.
                Md5::digest(&self.content).as_slice() == expected
            }
        }
    }
}

fn parse_file_chunk(payload: &[u8]) -> Result<FileChunk> {
    let op = opcode::FILE_TRANSFER;
    let file_type = read_u8(payload, 0, op)?;
    let file_length = read_u32(payload, 1, op)?;
    let check_type = read_u8(payload, 5, op)?;

    let (check, mut at) = if check_type == 0x01 {
        let digest: [u8; 16] = read_bytes(payload, 6, 16, op)?
            .try_into()
            .expect("slice length checked");
        (ChunkCheck::Md5(digest), 22)
    } else {
        (ChunkCheck::Crc(read_u16(payload, 6, op)?), 8)
    };

    let start = read_u32(payload, at, op)?;
    let chunk_len = usize::from(read_u16(payload, at + 4, op)?);
    let content = read_bytes(payload, at + 6, chunk_len, op)?.to_vec();
    at += 6 + chunk_len;

    let tag = match file_type {
        0x00 | 0x02 => ChunkTag::Timestamp(read_datetime(payload, at, op)?),
        0x01 => ChunkTag::Serial(read_u16(payload, at, op)?),
        _ => ChunkTag::None,
    };

    Ok(FileChunk {
        file_type,
        file_length,
        check,
        start,
        content,
        tag,
    })
}

// ---------------------------------------------------------------------------
// Information transmission (0x94)
// ---------------------------------------------------------------------------

/// Door sensor state from sub-opcode 0x05.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DoorStatus {
    pub open: bool,
    pub triggering_high: bool,
    pub io_high: bool,
}

/// The 0x94 sub-payloads.
#[derive(Debug, Clone, Serialize)]
pub enum InfoPayload {
    /// Sub 0x00: external supply in volts.
    ExternalVoltage(f32),
    /// Sub 0x04: `KEY=VAL;...` status synchronisation.
    StatusSync {
        pairs: BTreeMap<String, String>,
        /// Bit1 of the hex `DYD` value: relay currently cut.
        oil_disconnected: bool,
    },
    /// Sub 0x05.
    Door(DoorStatus),
    /// Sub 0x0A: SIM ICCID, hex-rendered.
    Iccid(String),
    /// Any other sub-opcode, kept raw.
    Raw { sub: u8, data: Vec<u8> },
}

fn parse_info(payload: &[u8]) -> Result<InfoPayload> {
    let op = opcode::INFO_TRANSMISSION;
    let sub = read_u8(payload, 0, op)?;
    match sub {
        0x00 => {
            let centivolts = read_u16(payload, 1, op)?;
            Ok(InfoPayload::ExternalVoltage(f32::from(centivolts) / 100.0))
        }
        0x04 => {
            let text = String::from_utf8_lossy(&payload[1..]);
            let mut pairs = BTreeMap::new();
            for item in text.split(';') {
                if let Some((key, value)) = item.split_once('=') {
                    pairs.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
            let oil_disconnected = pairs
                .get("DYD")
                .and_then(|v| u32::from_str_radix(v, 16).ok())
                .is_some_and(|v| v & 0x02 != 0);
            Ok(InfoPayload::StatusSync {
                pairs,
                oil_disconnected,
            })
        }
        0x05 => {
            let b = read_u8(payload, 1, op)?;
            Ok(InfoPayload::Door(DoorStatus {
                open: b & 0x01 != 0,
                triggering_high: b & 0x02 != 0,
                io_high: b & 0x04 != 0,
            }))
        }
        0x0A => {
            let iccid = read_bytes(payload, 1, 10, op)?;
            Ok(InfoPayload::Iccid(hex::encode_upper(iccid)))
        }
        _ => Ok(InfoPayload::Raw {
            sub,
            data: payload[1..].to_vec(),
        }),
    }
}

// ---------------------------------------------------------------------------
// External passthrough (0x9B, 0x9C)
// ---------------------------------------------------------------------------

/// Opaque payload from an attached external device.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalData {
    pub data: Vec<u8>,
}

fn parse_external(payload: &[u8]) -> Result<ExternalData> {
    let op = opcode::EXTERNAL_DATA;
    let len = usize::from(read_u8(payload, 0, op)?);
    Ok(ExternalData {
        data: read_bytes(payload, 1, len, op)?.to_vec(),
    })
}

/// Opaque payload from an addressed external module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleData {
    pub module_id: u8,
    pub data: Vec<u8>,
}

fn parse_module(payload: &[u8]) -> Result<ModuleData> {
    let op = opcode::MODULE_DATA;
    let module_id = read_u8(payload, 0, op)?;
    let len = usize::from(read_u8(payload, 1, op)?);
    Ok(ModuleData {
        module_id,
        data: read_bytes(payload, 2, len, op)?.to_vec(),
    })
}
