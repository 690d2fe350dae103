//! Per-connection session state.
//!
//! A session is created on TCP accept and destroyed on close. It carries the
//! device identity once a login frame binds one, the map of in-flight
//! operator commands keyed by their 16-bit sequence, and the most recent
//! battery and odometer observations for the control surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;

use crate::types::{ConnId, DeviceId, Sequence};
use crate::COMMAND_TIMEOUT;

/// A value with the instant it was observed.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Observation<T> {
    pub value: T,
    pub at: DateTime<Utc>,
}

impl<T> Observation<T> {
    fn now(value: T) -> Self {
        Self {
            value,
            at: Utc::now(),
        }
    }
}

/// One in-flight operator command awaiting its device response.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command: String,
    pub sent_at: Instant,
    pub device_id: DeviceId,
}

/// Pending-command map with sweep-based expiry.
///
/// Entries live [`COMMAND_TIMEOUT`]; the owning connection task sweeps once
/// a second instead of arming a timer per entry.
#[derive(Debug, Default)]
pub struct PendingCommands {
    entries: HashMap<u16, PendingCommand>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a sequence that is not currently in flight.
    ///
    /// Sequences are random per the wire contract; re-rolling on collision
    /// keeps correlation unambiguous within the expiry window.
    pub fn unused_sequence(&self) -> Sequence {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: u16 = rng.gen();
            if !self.entries.contains_key(&candidate) {
                return Sequence(candidate);
            }
        }
    }

    pub fn insert(&mut self, seq: Sequence, command: String, device_id: DeviceId) {
        self.entries.insert(
            seq.0,
            PendingCommand {
                command,
                sent_at: Instant::now(),
                device_id,
            },
        );
    }

    /// Remove and return the entry matching a device response.
    pub fn take(&mut self, seq: Sequence) -> Option<PendingCommand> {
        self.entries.remove(&seq.0)
    }

    /// Remove and return every entry older than the timeout.
    pub fn sweep(&mut self, ttl: Duration) -> Vec<(Sequence, PendingCommand)> {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= ttl)
            .map(|(&seq, _)| seq)
            .collect();
        expired
            .into_iter()
            .filter_map(|seq| self.entries.remove(&seq).map(|e| (Sequence(seq), e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-connection state shared between the connection task, the registry
/// and the control surface.
pub struct DeviceSession {
    /// Process-local connection id.
    pub conn_id: ConnId,
    /// Remote endpoint descriptor.
    pub remote: SocketAddr,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
    /// Bound on the first valid login frame, at most once per lifetime.
    device_id: RwLock<Option<DeviceId>>,
    /// In-flight operator commands.
    pending: Mutex<PendingCommands>,
    /// Last external battery voltage, volts.
    last_battery: RwLock<Option<Observation<f32>>>,
    /// Last odometer reading, meters.
    last_odometer: RwLock<Option<Observation<u32>>>,
}

impl DeviceSession {
    pub fn new(conn_id: ConnId, remote: SocketAddr) -> Self {
        Self {
            conn_id,
            remote,
            connected_at: Utc::now(),
            device_id: RwLock::new(None),
            pending: Mutex::new(PendingCommands::new()),
            last_battery: RwLock::new(None),
            last_odometer: RwLock::new(None),
        }
    }

    /// Bind the identity announced in a login frame.
    ///
    /// The first login wins; a re-login on the same socket with a different
    /// identifier is refused.
    pub fn bind_identity(&self, id: DeviceId) -> bool {
        let mut slot = self.device_id.write();
        match slot.as_ref() {
            None => {
                *slot = Some(id);
                true
            }
            Some(existing) => *existing == id,
        }
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id.read().clone()
    }

    pub fn is_identified(&self) -> bool {
        self.device_id.read().is_some()
    }

    pub fn record_battery(&self, volts: f32) {
        *self.last_battery.write() = Some(Observation::now(volts));
    }

    pub fn record_odometer(&self, meters: u32) {
        *self.last_odometer.write() = Some(Observation::now(meters));
    }

    pub fn last_battery(&self) -> Option<Observation<f32>> {
        *self.last_battery.read()
    }

    pub fn last_odometer(&self) -> Option<Observation<u32>> {
        *self.last_odometer.read()
    }

    /// Run `f` against the pending-command map.
    pub fn with_pending<R>(&self, f: impl FnOnce(&mut PendingCommands) -> R) -> R {
        f(&mut self.pending.lock())
    }

    /// Reporting snapshot for the control surface.
    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            identifier: self.device_id().map(|id| id.to_string()),
            remote: self.remote.to_string(),
            connected_at: self.connected_at,
            last_battery_v: self.last_battery().map(|o| o.value),
            battery_observed_at: self.last_battery().map(|o| o.at),
            last_odometer_m: self.last_odometer().map(|o| o.value),
            odometer_observed_at: self.last_odometer().map(|o| o.at),
        }
    }
}

/// What the operator sees for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub identifier: Option<String>,
    pub remote: String,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_battery_v: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_observed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_odometer_m: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub odometer_observed_at: Option<DateTime<Utc>>,
}

/// Default pending-command lifetime, re-exported for sweeps.
pub const PENDING_TTL: Duration = COMMAND_TIMEOUT;

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> DeviceSession {
        DeviceSession::new(ConnId::next(), "127.0.0.1:9000".parse().unwrap())
    }

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    #[test]
    fn test_identity_binds_once() {
        let s = session();
        assert!(!s.is_identified());
        assert!(s.bind_identity(id("355172107461053")));
        // same identifier again is a no-op, different one is refused
        assert!(s.bind_identity(id("355172107461053")));
        assert!(!s.bind_identity(id("123456789012345")));
        assert_eq!(s.device_id(), Some(id("355172107461053")));
    }

    #[test]
    fn test_pending_take_matches_once() {
        let s = session();
        let seq = s.with_pending(|p| {
            let seq = p.unused_sequence();
            p.insert(seq, "STATUS#".into(), id("355172107461053"));
            seq
        });

        let first = s.with_pending(|p| p.take(seq));
        assert_eq!(first.unwrap().command, "STATUS#");
        // a second response with the same sequence is unmatched
        assert!(s.with_pending(|p| p.take(seq)).is_none());
    }

    #[test]
    fn test_pending_sweep_expires_only_old_entries() {
        let s = session();
        s.with_pending(|p| {
            p.insert(Sequence(1), "STATUS#".into(), id("355172107461053"));
        });

        let fresh = s.with_pending(|p| p.sweep(Duration::from_secs(60)));
        assert!(fresh.is_empty());

        let expired = s.with_pending(|p| p.sweep(Duration::ZERO));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, Sequence(1));
        assert!(s.with_pending(|p| p.is_empty()));
    }

    #[test]
    fn test_unused_sequence_avoids_collisions() {
        let mut pending = PendingCommands::new();
        // Fill a chunk of the space and make sure fresh picks stay outside.
        for seq in 0..512u16 {
            pending.insert(Sequence(seq), "WHERE#".into(), id("1"));
        }
        for _ in 0..100 {
            let seq = pending.unused_sequence();
            assert!(seq.0 >= 512);
        }
    }

    #[test]
    fn test_observations() {
        let s = session();
        assert!(s.last_battery().is_none());
        s.record_battery(12.34);
        s.record_odometer(1_000_000);
        assert!((s.last_battery().unwrap().value - 12.34).abs() < f32::EPSILON);
        assert_eq!(s.last_odometer().unwrap().value, 1_000_000);

        let info = s.snapshot();
        assert_eq!(info.last_odometer_m, Some(1_000_000));
        assert!(info.identifier.is_none());
    }
}
