//! Per-connection task: read loop, opcode dispatch, acknowledgment path.
//!
//! Each accepted socket gets one task. Inbound bytes append to the codec
//! buffer and frames dispatch serially in arrival order; the acknowledgment
//! for frame N is queued to the writer before frame N+1 is even decoded.
//! Writes are serialized through a bounded channel into a dedicated writer
//! task, so a stamped frame is never interleaved with another frame's bytes.
//! A full channel means the device is not draining its socket: the session
//! closes itself rather than stall the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use super::registry::{SessionHandle, SessionRegistry};
use super::session::{DeviceSession, PENDING_TTL};
use crate::protocol::builder::{build_ack, build_file_ack, build_module_ack, build_time_response};
use crate::protocol::message::{InfoPayload, Message};
use crate::protocol::{opcode, FrameCodec, RawFrame};
use crate::types::ConnId;

/// Drive one device connection to completion.
pub(crate) async fn run(
    stream: TcpStream,
    remote: SocketAddr,
    registry: Arc<SessionRegistry>,
    outbound_queue: usize,
) {
    let conn_id = ConnId::next();
    let session = Arc::new(DeviceSession::new(conn_id, remote));
    info!(conn = %conn_id, remote = %remote, "connection_open");

    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(outbound_queue);

    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => break "peer_closed",
                Ok(_) => match drain_frames(&mut codec, &mut buf, &session, &registry, &tx) {
                    Ok(()) => {}
                    Err(reason) => break reason,
                },
                Err(err) => {
                    warn!(conn = %conn_id, error = %err, "read failed");
                    break "io_error";
                }
            },
            _ = sweep.tick() => {
                for (seq, entry) in session.with_pending(|p| p.sweep(PENDING_TTL)) {
                    warn!(
                        imei = %entry.device_id,
                        command = %entry.command,
                        sequence = %seq,
                        "command_timeout"
                    );
                }
            }
        }
    };

    // Closing cancels the expiry sweep and drops the remaining pending
    // entries with it; the registry entry goes only if we still own it.
    if let Some(id) = session.device_id() {
        registry.unbind_if_owner(&id, conn_id);
    }
    drop(tx);
    let _ = writer.await;

    info!(conn = %conn_id, remote = %remote, reason, "connection_close");
}

/// Decode and dispatch every complete frame in the buffer.
///
/// Returns a close reason when the connection has to go down: an oversize
/// declared length or an outbound queue that will not drain.
fn drain_frames(
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
    session: &Arc<DeviceSession>,
    registry: &Arc<SessionRegistry>,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<(), &'static str> {
    loop {
        let frame = match codec.decode(buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "frame_too_large");
                return Err("frame_too_large");
            }
        };

        if let Some(reply) = handle_frame(&frame, session, registry, tx) {
            match tx.try_send(reply) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn = %session.conn_id, "outbound queue full");
                    return Err("backpressure");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err("writer_gone"),
            }
        }
    }
}

/// Parse one frame, apply its side effects, and return the ack to write,
/// if the opcode calls for one. Parser errors drop the frame, never the
/// connection.
fn handle_frame(
    frame: &RawFrame,
    session: &Arc<DeviceSession>,
    registry: &Arc<SessionRegistry>,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Option<Vec<u8>> {
    let seq = frame.sequence();
    debug!(
        opcode = format_args!("{:#04x}", frame.opcode()),
        len = frame.len(),
        sequence = %seq,
        "frame_received"
    );

    if let Err(err) = frame.verify_crc() {
        warn!(
            opcode = format_args!("{:#04x}", frame.opcode()),
            error = %err,
            "crc_mismatch"
        );
    }

    let message = match Message::parse(frame) {
        Ok(message) => message,
        Err(err) => {
            warn!(
                opcode = format_args!("{:#04x}", frame.opcode()),
                error = %err,
                "frame dropped"
            );
            return None;
        }
    };

    let imei = session
        .device_id()
        .map_or_else(String::new, |id| id.to_string());

    match message {
        Message::Login(login) => {
            if session.bind_identity(login.device_id.clone()) {
                registry.bind(
                    login.device_id.clone(),
                    SessionHandle {
                        session: Arc::clone(session),
                        outbound: tx.clone(),
                    },
                );
                info!(
                    imei = %login.device_id,
                    model = login.model,
                    sequence = %seq,
                    "login"
                );
            } else {
                warn!(
                    imei = %login.device_id,
                    bound = %imei,
                    "login with a conflicting identifier ignored"
                );
            }
            Some(build_ack(opcode::LOGIN, seq))
        }

        Message::Heartbeat(hb) => {
            info!(
                imei = %imei,
                battery = %hb.battery,
                signal = %hb.signal,
                acc = hb.terminal.acc_high,
                charging = hb.terminal.charging,
                oil_disconnected = hb.terminal.oil_disconnected,
                defense = hb.terminal.defense_active,
                "heartbeat"
            );
            Some(build_ack(opcode::HEARTBEAT, seq))
        }

        Message::Position(pos) => {
            if let Some(meters) = pos.odometer_m {
                session.record_odometer(meters);
            }
            info!(
                imei = %imei,
                time = %pos.time,
                lat = pos.fix.latitude,
                lon = pos.fix.longitude,
                speed_kmh = pos.fix.speed_kmh,
                course = pos.fix.course,
                positioned = pos.fix.positioned,
                satellites = pos.fix.satellites,
                upload_mode = ?pos.upload_mode,
                odometer_m = pos.odometer_m,
                "gps_location"
            );
            None
        }

        Message::Alarm(alarm) => {
            info!(imei = %imei, kind = %alarm.kind, time = %alarm.time, "alarm");
            Some(build_ack(opcode::ALARM, seq))
        }

        Message::AlarmExtended(alarm) => {
            info!(
                imei = %imei,
                kind = %alarm.kind,
                time = %alarm.time,
                positioned = alarm.fix.map(|f| f.positioned),
                "alarm"
            );
            Some(build_ack(opcode::ALARM_EXTENDED, seq))
        }

        Message::LbsAlarm(alarm) => {
            info!(
                imei = %imei,
                kind = %alarm.kind,
                mcc = alarm.cell.mcc,
                lac = alarm.cell.lac,
                cell_id = alarm.cell.cell_id,
                "alarm"
            );
            Some(build_ack(opcode::LBS_ALARM, seq))
        }

        Message::LbsExtension(ext) => {
            debug!(
                imei = %imei,
                mcc = ext.cells.main.mcc,
                neighbors = ext.cells.neighbors.len(),
                "lbs_extension"
            );
            None
        }

        Message::WifiScan(scan) => {
            info!(imei = %imei, aps = scan.aps.len(), "wifi_scan");
            Some(build_ack(opcode::WIFI_SCAN, seq))
        }

        Message::CommandResponse(resp) | Message::CommandResponseJm01(resp) => {
            match session.with_pending(|p| p.take(seq)) {
                Some(entry) => info!(
                    imei = %entry.device_id,
                    command = %entry.command,
                    response = %resp.text,
                    latency_ms = entry.sent_at.elapsed().as_millis() as u64,
                    "command_response_matched"
                ),
                None => info!(
                    imei = %imei,
                    sequence = %seq,
                    response = %resp.text,
                    "command_response_unmatched"
                ),
            }
            None
        }

        Message::TimeRequest => Some(build_time_response(Utc::now(), seq)),

        Message::FileTransfer(chunk) => {
            info!(
                imei = %imei,
                file_type = chunk.file_type,
                start = chunk.start,
                chunk_len = chunk.content.len(),
                verified = chunk.verify(),
                complete = chunk.is_complete(),
                "file_transfer"
            );
            Some(build_file_ack(seq))
        }

        Message::InfoTransmission(payload) => {
            match payload {
                InfoPayload::ExternalVoltage(volts) => {
                    session.record_battery(volts);
                    info!(imei = %imei, volts = f64::from(volts), "external_voltage");
                }
                InfoPayload::StatusSync {
                    pairs,
                    oil_disconnected,
                } => {
                    info!(
                        imei = %imei,
                        keys = pairs.len(),
                        oil_disconnected,
                        "status_sync"
                    );
                }
                InfoPayload::Door(door) => {
                    info!(imei = %imei, open = door.open, "door_status");
                }
                InfoPayload::Iccid(iccid) => {
                    info!(imei = %imei, iccid = %iccid, "iccid");
                }
                InfoPayload::Raw { sub, data } => {
                    debug!(
                        imei = %imei,
                        sub = format_args!("{sub:#04x}"),
                        payload = %hex::encode(data),
                        "info_transmission"
                    );
                }
            }
            None
        }

        Message::ExternalData(ext) => {
            debug!(imei = %imei, len = ext.data.len(), "external_data");
            Some(build_ack(opcode::EXTERNAL_DATA, seq))
        }

        Message::ModuleData(md) => {
            debug!(
                imei = %imei,
                module = format_args!("{:#04x}", md.module_id),
                len = md.data.len(),
                "module_data"
            );
            Some(build_module_ack(md.module_id, seq))
        }

        Message::Unknown { opcode, payload } => {
            info!(
                imei = %imei,
                opcode = format_args!("{opcode:#04x}"),
                payload = %hex::encode(payload),
                "unknown_opcode"
            );
            None
        }
    }
}
