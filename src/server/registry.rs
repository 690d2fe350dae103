//! Online-device registry and the operator command entry point.
//!
//! Maps device identifiers to live sessions. Insertion happens on login and
//! replaces any prior entry for the same identifier (trackers reconnect
//! aggressively; the stale socket drops on its own). Removal is owner-checked
//! and idempotent, so a late disconnect never evicts a newer session.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::session::{DeviceSession, SessionInfo};
use crate::error::Result;
use crate::protocol::builder::encode_command;
use crate::types::{ConnId, DeviceId, Sequence};

/// A live session as seen from outside its connection task.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: Arc<DeviceSession>,
    /// Serialized outbound byte path into the connection's writer task.
    pub outbound: mpsc::Sender<Vec<u8>>,
}

/// Result of an operator command submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Bytes queued to the transport; correlate on this sequence.
    Accepted { sequence: Sequence },
    /// No online session for the identifier, nothing was sent.
    NotConnected,
}

/// Aggregate server statistics for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub session_count: usize,
    pub listen_port: u16,
    pub uptime_seconds: u64,
}

/// Concurrent identifier-to-session map.
pub struct SessionRegistry {
    sessions: DashMap<DeviceId, SessionHandle>,
    listen_port: u16,
    started_at: Instant,
}

impl SessionRegistry {
    pub fn new(listen_port: u16) -> Self {
        Self {
            sessions: DashMap::new(),
            listen_port,
            started_at: Instant::now(),
        }
    }

    /// Register a session under its announced identifier.
    ///
    /// Property 8: at most one live session per identifier — a re-login
    /// replaces the entry and the replaced socket drains naturally.
    pub fn bind(&self, id: DeviceId, handle: SessionHandle) {
        if let Some(prior) = self.sessions.insert(id.clone(), handle) {
            info!(
                imei = %id,
                old_conn = %prior.session.conn_id,
                "re-login replaced an existing session"
            );
        }
    }

    /// Remove the entry if `conn_id` still owns it. Idempotent.
    pub fn unbind_if_owner(&self, id: &DeviceId, conn_id: ConnId) {
        self.sessions
            .remove_if(id, |_, handle| handle.session.conn_id == conn_id);
    }

    pub fn get(&self, id: &DeviceId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every online session.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.session.snapshot())
            .collect()
    }

    /// Snapshot of one session.
    pub fn get_info(&self, id: &DeviceId) -> Option<SessionInfo> {
        self.get(id).map(|handle| handle.session.snapshot())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            session_count: self.session_count(),
            listen_port: self.listen_port,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Encode and queue a command to an online device.
    ///
    /// The pending entry is registered before the bytes are queued, so a
    /// fast device cannot respond to a sequence the map has never seen.
    pub fn send_command(&self, id: &DeviceId, text: &str) -> Result<CommandOutcome> {
        let Some(handle) = self.get(id) else {
            debug!(imei = %id, command = text, "command refused, device offline");
            return Ok(CommandOutcome::NotConnected);
        };

        let (sequence, packet) = handle.session.with_pending(|pending| {
            let sequence = pending.unused_sequence();
            let packet = encode_command(text, sequence)?;
            pending.insert(sequence, text.to_string(), id.clone());
            Ok::<_, crate::Error>((sequence, packet))
        })?;

        match handle.outbound.try_send(packet) {
            Ok(()) => {
                info!(
                    imei = %id,
                    command = text,
                    sequence = %sequence,
                    "command_sent"
                );
                Ok(CommandOutcome::Accepted { sequence })
            }
            Err(err) => {
                // Queue full or writer gone: the connection is on its way
                // out, drop the pending entry we just created.
                handle.session.with_pending(|pending| pending.take(sequence));
                warn!(imei = %id, error = %err, "command not queued");
                Ok(CommandOutcome::NotConnected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(conn_id: ConnId, queue: usize) -> (SessionHandle, mpsc::Receiver<Vec<u8>>) {
        let session = Arc::new(DeviceSession::new(
            conn_id,
            "10.0.0.1:40001".parse().unwrap(),
        ));
        let (tx, rx) = mpsc::channel(queue);
        (
            SessionHandle {
                session,
                outbound: tx,
            },
            rx,
        )
    }

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    #[test]
    fn test_relogin_replaces_entry() {
        let registry = SessionRegistry::new(5027);
        let imei = id("355172107461053");

        let (first, _rx1) = handle(ConnId::next(), 4);
        let first_conn = first.session.conn_id;
        registry.bind(imei.clone(), first);

        let (second, _rx2) = handle(ConnId::next(), 4);
        let second_conn = second.session.conn_id;
        registry.bind(imei.clone(), second);

        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.get(&imei).unwrap().session.conn_id, second_conn);

        // The replaced connection's close must not evict the newer session.
        registry.unbind_if_owner(&imei, first_conn);
        assert_eq!(registry.session_count(), 1);

        registry.unbind_if_owner(&imei, second_conn);
        assert!(registry.is_empty());
        // and removal is idempotent
        registry.unbind_if_owner(&imei, second_conn);
    }

    #[test]
    fn test_send_command_offline() {
        let registry = SessionRegistry::new(5027);
        let outcome = registry
            .send_command(&id("355172107461053"), "STATUS#")
            .unwrap();
        assert_eq!(outcome, CommandOutcome::NotConnected);
    }

    #[test]
    fn test_send_command_queues_packet_and_pending_entry() {
        let registry = SessionRegistry::new(5027);
        let imei = id("355172107461053");
        let (h, mut rx) = handle(ConnId::next(), 4);
        let session = Arc::clone(&h.session);
        registry.bind(imei.clone(), h);

        let outcome = registry.send_command(&imei, "STATUS#").unwrap();
        let CommandOutcome::Accepted { sequence } = outcome else {
            panic!("expected accepted, got {outcome:?}");
        };

        let packet = rx.try_recv().unwrap();
        assert_eq!(&packet[..2], &[0x78, 0x78]);
        assert_eq!(packet[3], 0x80);
        // ASCII "STATUS#" somewhere in the body
        assert!(packet
            .windows(7)
            .any(|w| w == [0x53, 0x54, 0x41, 0x54, 0x55, 0x53, 0x23]));

        let entry = session.with_pending(|p| p.take(sequence)).unwrap();
        assert_eq!(entry.command, "STATUS#");
        assert_eq!(entry.device_id, imei);
    }

    #[test]
    fn test_send_command_invalid_text_is_error() {
        let registry = SessionRegistry::new(5027);
        let imei = id("355172107461053");
        let (h, _rx) = handle(ConnId::next(), 4);
        registry.bind(imei.clone(), h);
        assert!(registry.send_command(&imei, "STATUS").is_err());
    }

    #[test]
    fn test_send_command_full_queue_rolls_back_pending() {
        let registry = SessionRegistry::new(5027);
        let imei = id("355172107461053");
        let (h, _rx) = handle(ConnId::next(), 1);
        let session = Arc::clone(&h.session);
        registry.bind(imei.clone(), h);

        assert!(matches!(
            registry.send_command(&imei, "WHERE#").unwrap(),
            CommandOutcome::Accepted { .. }
        ));
        // Queue of one is now full; the second command must not leave a
        // stray pending entry behind.
        assert_eq!(
            registry.send_command(&imei, "STATUS#").unwrap(),
            CommandOutcome::NotConnected
        );
        assert_eq!(session.with_pending(|p| p.len()), 1);
    }

    #[test]
    fn test_stats_shape() {
        let registry = SessionRegistry::new(5027);
        let stats = registry.stats();
        assert_eq!(stats.session_count, 0);
        assert_eq!(stats.listen_port, 5027);
    }
}
