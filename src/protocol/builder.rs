//! Outbound frame builders: acknowledgments, the time-calibration response,
//! and the operator command packet.
//!
//! Inbound CRC handling is permissive, but every frame built here is stamped
//! with a correct CRC over the length field through the sequence inclusive.

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::crc::crc;
use super::{opcode, TERMINATOR};
use crate::error::{ProtocolError, Result};
use crate::types::Sequence;

/// Server flag carried in the 0x80 command packet.
const SERVER_FLAG: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// Language word: English.
const LANGUAGE: [u8; 2] = [0x00, 0x02];

/// Stamp the CRC and terminator onto a short-framed body (`body` starts at
/// the length field).
fn seal_short(mut body: Vec<u8>) -> Vec<u8> {
    let mut out = vec![super::START_SHORT, super::START_SHORT];
    out.append(&mut body);
    let fcs = crc(&out[2..]);
    out.extend_from_slice(&fcs.to_be_bytes());
    out.extend_from_slice(&TERMINATOR);
    out
}

/// As [`seal_short`] but with the `0x7979` marker and two-byte length.
fn seal_long(mut body: Vec<u8>) -> Vec<u8> {
    let mut out = vec![super::START_LONG, super::START_LONG];
    out.append(&mut body);
    let fcs = crc(&out[2..]);
    out.extend_from_slice(&fcs.to_be_bytes());
    out.extend_from_slice(&TERMINATOR);
    out
}

/// Generic short acknowledgment: `78 78 05 <op> <seq> <crc> 0D 0A`.
pub fn build_ack(op: u8, seq: Sequence) -> Vec<u8> {
    let mut body = vec![0x05, op];
    body.extend_from_slice(&seq.to_be_bytes());
    seal_short(body)
}

/// Module acknowledgment (0x9C) echoing the module id.
pub fn build_module_ack(module_id: u8, seq: Sequence) -> Vec<u8> {
    let mut body = vec![0x06, opcode::MODULE_DATA, module_id];
    body.extend_from_slice(&seq.to_be_bytes());
    seal_short(body)
}

/// Time calibration response (0x8A) carrying the given UTC instant.
pub fn build_time_response(now: DateTime<Utc>, seq: Sequence) -> Vec<u8> {
    let mut body = vec![
        0x0B,
        opcode::TIME_REQUEST,
        (now.year() - 2000) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ];
    body.extend_from_slice(&seq.to_be_bytes());
    seal_short(body)
}

/// File-transfer chunk acknowledgment (0x8D), long-framed:
/// `79 79 00 06 8D <success> <seq> <crc> 0D 0A`.
pub fn build_file_ack(seq: Sequence) -> Vec<u8> {
    let mut body = vec![0x00, 0x06, opcode::FILE_TRANSFER, 0x01];
    body.extend_from_slice(&seq.to_be_bytes());
    seal_long(body)
}

/// Encode an operator command (0x80).
///
/// The inner body is `server_flag(4) || command || language(2) || seq(2)`;
/// framing flips to long when the declared packet length no longer fits one
/// byte. Commands are ASCII and end with `#`.
pub fn encode_command(text: &str, seq: Sequence) -> Result<Vec<u8>> {
    if !text.is_ascii() || !text.ends_with('#') || text.len() == 1 {
        return Err(ProtocolError::InvalidCommand(text.to_string()).into());
    }

    let command_length = SERVER_FLAG.len() + text.len() + LANGUAGE.len();
    if command_length > 255 {
        return Err(ProtocolError::InvalidCommand(format!(
            "command of {} bytes exceeds the one-byte length field",
            text.len()
        ))
        .into());
    }

    // opcode + length byte + inner + sequence + crc
    let packet_length = 1 + 1 + command_length + 2 + 2;

    let mut body = Vec::with_capacity(packet_length + 4);
    if packet_length < 256 {
        body.push(packet_length as u8);
    } else {
        body.extend_from_slice(&(packet_length as u16).to_be_bytes());
    }
    body.push(opcode::COMMAND);
    body.push(command_length as u8);
    body.extend_from_slice(&SERVER_FLAG);
    body.extend_from_slice(text.as_bytes());
    body.extend_from_slice(&LANGUAGE);
    body.extend_from_slice(&seq.to_be_bytes());

    Ok(if packet_length < 256 {
        seal_short(body)
    } else {
        seal_long(body)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::RawFrame;
    use crate::protocol::message::Message;

    #[test]
    fn test_login_ack_exact_bytes() {
        // Scenario S1: the ack for sequence 0x0001, byte for byte.
        assert_eq!(
            build_ack(opcode::LOGIN, Sequence(0x0001)),
            vec![0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A]
        );
    }

    #[test]
    fn test_acks_round_trip_through_codec() {
        // Property 3: every ack decodes back to a frame of the expected
        // opcode and sequence with a valid CRC.
        for (op, seq) in [
            (opcode::LOGIN, Sequence(0x0001)),
            (opcode::HEARTBEAT, Sequence(0x0010)),
            (opcode::ALARM, Sequence(0x0081)),
            (opcode::ALARM_EXTENDED, Sequence(0xFFFF)),
            (opcode::LBS_ALARM, Sequence(0x0000)),
            (opcode::WIFI_SCAN, Sequence(0x0C0C)),
            (opcode::EXTERNAL_DATA, Sequence(0x4242)),
        ] {
            let ack = build_ack(op, seq);
            let frame = RawFrame::from_bytes(&ack).unwrap();
            assert_eq!(frame.opcode(), op);
            assert_eq!(frame.sequence(), seq);
            assert!(frame.verify_crc().is_ok());
            assert!(frame.terminator_ok());
        }
    }

    #[test]
    fn test_module_ack_carries_module_id() {
        let ack = build_module_ack(0x07, Sequence(0x0061));
        let frame = RawFrame::from_bytes(&ack).unwrap();
        assert_eq!(frame.opcode(), opcode::MODULE_DATA);
        assert_eq!(frame.payload(), &[0x07]);
        assert_eq!(frame.sequence(), Sequence(0x0061));
        assert!(frame.verify_crc().is_ok());
    }

    #[test]
    fn test_time_response_layout() {
        let now = chrono::NaiveDate::from_ymd_opt(2026, 8, 2)
            .unwrap()
            .and_hms_opt(13, 37, 59)
            .unwrap()
            .and_utc();
        let resp = build_time_response(now, Sequence(0x0099));
        let frame = RawFrame::from_bytes(&resp).unwrap();
        assert_eq!(frame.opcode(), opcode::TIME_REQUEST);
        assert_eq!(frame.payload(), &[26, 8, 2, 13, 37, 59]);
        assert!(frame.verify_crc().is_ok());
    }

    #[test]
    fn test_file_ack_is_long_framed() {
        let ack = build_file_ack(Sequence(0x0010));
        assert_eq!(&ack[..4], &[0x79, 0x79, 0x00, 0x06]);
        let frame = RawFrame::from_bytes(&ack).unwrap();
        assert!(frame.is_long());
        assert_eq!(frame.opcode(), opcode::FILE_TRANSFER);
        assert_eq!(frame.payload(), &[0x01]);
        assert!(frame.verify_crc().is_ok());
    }

    #[test]
    fn test_encode_command_layout() {
        let packet = encode_command("STATUS#", Sequence(0xABCD)).unwrap();
        assert_eq!(&packet[..2], &[0x78, 0x78]);
        assert_eq!(packet[3], opcode::COMMAND);
        // server flag then the ASCII command
        assert_eq!(&packet[5..9], &SERVER_FLAG);
        assert_eq!(&packet[9..16], b"STATUS#");
        assert_eq!(&packet[16..18], &LANGUAGE);

        let frame = RawFrame::from_bytes(&packet).unwrap();
        assert_eq!(frame.sequence(), Sequence(0xABCD));
        assert!(frame.verify_crc().is_ok());
    }

    #[test]
    fn test_encode_command_response_round_trip() {
        // A device echoing our framing parses as a command response.
        let packet = encode_command("RELAY,1#", Sequence(0x0042)).unwrap();
        let frame = RawFrame::from_bytes(&packet).unwrap();
        let cmd_len = frame.payload()[0] as usize;
        assert_eq!(cmd_len, 4 + 8 + 2);

        // Re-frame the inner text as a 0x21 response and parse it.
        let mut body = vec![0x00, 0x00, 0x00, 0x01, 8];
        body.extend_from_slice(b"RELAY,1#");
        let mut resp = vec![0x78, 0x78, (1 + body.len() + 4) as u8, 0x21];
        resp.extend_from_slice(&body);
        resp.extend_from_slice(&[0x00, 0x42]);
        let fcs = crc(&resp[2..]);
        resp.extend_from_slice(&fcs.to_be_bytes());
        resp.extend_from_slice(&TERMINATOR);

        let parsed = Message::parse(&RawFrame::from_bytes(&resp).unwrap()).unwrap();
        match parsed {
            Message::CommandResponse(r) => assert_eq!(r.text, "RELAY,1#"),
            other => panic!("expected command response, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_command_rejects_bad_input() {
        assert!(encode_command("STATUS", Sequence(1)).is_err());
        assert!(encode_command("#", Sequence(1)).is_err());
        assert!(encode_command("naročilo#", Sequence(1)).is_err());
        let oversized = format!("{}#", "X".repeat(300));
        assert!(encode_command(&oversized, Sequence(1)).is_err());
    }
}
