//! Arena of connection records addressed by generated handles.
//!
//! Every map in the higher layers keys on [`ConnectionId`]. A record stays in
//! the arena, marked disconnected, until its owner calls
//! [`reap`](ConnectionRegistry::reap), so a late reply or a concurrent
//! disconnect never observes a dangling peer.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable handle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw handle value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    /// Greeting sent, identification not yet received.
    Unidentified = 0,
    /// Role and name known.
    Identified = 1,
    /// Identified and the peer last reported itself busy.
    Busy = 2,
}

impl HandshakeState {
    /// Whether application traffic may flow.
    pub fn is_identified(self) -> bool {
        self != HandshakeState::Unidentified
    }
}

/// Snapshot of one connection record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Handle of this record.
    pub id: ConnectionId,
    /// Remote `ip:port` as seen by the server.
    pub remote: String,
    /// Peer role, e.g. `Producer`. Empty until identified.
    pub role: String,
    /// Peer-chosen name, possibly empty.
    pub name: String,
    /// Handshake progress.
    pub handshake: HandshakeState,
    /// Cleared on disconnect; the record lives on until reaped.
    pub connected: bool,
}

impl ConnectionInfo {
    /// Remote host without the port.
    pub fn remote_host(&self) -> &str {
        match self.remote.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.remote,
        }
    }
}

impl std::fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{} ({}, {})", self.role, self.name, self.remote, self.id)
    }
}

/// Thread-safe arena of connection records.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    records: RwLock<BTreeMap<ConnectionId, ConnectionInfo>>,
}

impl ConnectionRegistry {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new, unidentified connection.
    pub fn insert(&self, remote: impl Into<String>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = ConnectionInfo {
            id,
            remote: remote.into(),
            role: String::new(),
            name: String::new(),
            handshake: HandshakeState::Unidentified,
            connected: true,
        };
        self.records.write().insert(id, info);
        id
    }

    /// Snapshot of one record.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.records.read().get(&id).cloned()
    }

    /// Marks a connection identified with its role and name.
    ///
    /// Returns `false` without changing anything if the connection was
    /// already identified or is unknown.
    pub fn identify(&self, id: ConnectionId, role: &str, name: &str) -> bool {
        let mut records = self.records.write();
        match records.get_mut(&id) {
            Some(info) if info.handshake == HandshakeState::Unidentified => {
                info.role = role.to_string();
                info.name = name.to_string();
                info.handshake = HandshakeState::Identified;
                true
            }
            _ => false,
        }
    }

    /// Toggles the busy marker of an identified connection.
    pub fn set_busy(&self, id: ConnectionId, busy: bool) {
        if let Some(info) = self.records.write().get_mut(&id) {
            if info.handshake.is_identified() {
                info.handshake = if busy {
                    HandshakeState::Busy
                } else {
                    HandshakeState::Identified
                };
            }
        }
    }

    /// Whether the connection has completed identification.
    pub fn is_identified(&self, id: ConnectionId) -> bool {
        self.records
            .read()
            .get(&id)
            .map(|info| info.handshake.is_identified())
            .unwrap_or(false)
    }

    /// Flags a connection as gone without removing it.
    pub fn mark_disconnected(&self, id: ConnectionId) {
        if let Some(info) = self.records.write().get_mut(&id) {
            info.connected = false;
        }
    }

    /// Removes a record for good.
    pub fn reap(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.records.write().remove(&id)
    }

    /// Connected records, in handle order.
    pub fn connected(&self) -> Vec<ConnectionInfo> {
        self.records
            .read()
            .values()
            .filter(|info| info.connected)
            .cloned()
            .collect()
    }

    /// Handles of connected records, optionally only identified ones.
    pub fn connected_ids(&self, identified_only: bool) -> Vec<ConnectionId> {
        self.records
            .read()
            .values()
            .filter(|info| info.connected && (!identified_only || info.handshake.is_identified()))
            .map(|info| info.id)
            .collect()
    }

    /// Number of records, connected or not.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
