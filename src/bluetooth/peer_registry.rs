//! Peer Registry
//!
//! Tracks discovered peers, their connection state and last reported
//! position. Owned exclusively by the session task, so it needs no locking.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::Role;
use crate::error::MeshError;
use crate::message::GeoPoint;

/// Transport-level peer identifier (opaque, supplied by the radio)
pub type PeerAddress = String;

/// Connection state for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,   // Seen in an advertisement, never connected
    Connecting,   // Connection attempt in progress
    Connected,    // Link is up
    Disconnected, // Link lost or attempt failed
}

impl ConnectionState {
    /// Strict transition check
    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState, MeshError> {
        use ConnectionState::*;

        match (self, to) {
            (Discovered, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
            | (Connected, Connecting)
            | (Disconnected, Connecting) => Ok(to),
            _ => Err(MeshError::InvalidTransition { from: self, to }),
        }
    }

    /// States to pass through to reach `to`, inserting the intermediate
    /// `Connecting` that radio stacks tend to coalesce away.
    /// Empty when already there or when `to` cannot be reached.
    pub fn path_to(self, to: ConnectionState) -> Vec<ConnectionState> {
        use ConnectionState::*;

        if self == to {
            return Vec::new();
        }
        if self.transition(to).is_ok() {
            return vec![to];
        }

        match to {
            Connected | Disconnected => vec![Connecting, to],
            // Discovered is only ever the initial state
            Discovered | Connecting => Vec::new(),
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Information about a discovered peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: PeerAddress,
    pub display_name: Option<String>,
    /// Role announced in the peer's advertisement, if it announced one
    pub role: Option<Role>,
    pub connection_state: ConnectionState,
    pub last_location: Option<GeoPoint>,
    pub location_updated: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub message_count: u64,
}

impl PeerRecord {
    pub fn new(address: PeerAddress, display_name: Option<String>) -> Self {
        let now = Utc::now();

        Self {
            address,
            display_name,
            role: None,
            connection_state: ConnectionState::Discovered,
            last_location: None,
            location_updated: None,
            last_seen: now,
            first_seen: now,
            message_count: 0,
        }
    }

    /// Update peer's last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Whether the record is too old to be trusted for display
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (now - self.last_seen).to_std() {
            Ok(age) => age > window,
            // last_seen in the future: clock moved back, treat as fresh
            Err(_) => false,
        }
    }

    /// Name for display, falling back to the address
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.address)
    }
}

/// Aggregate counts over the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub located_peers: usize,
}

/// All peers known to one session
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerAddress, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a peer. Returns a copy of the stored record.
    pub fn upsert(&mut self, address: &str, display_name: Option<&str>) -> PeerRecord {
        if let Some(record) = self.peers.get_mut(address) {
            record.touch();
            if let Some(name) = display_name {
                record.display_name = Some(name.to_string());
            }
            debug!("Refreshed peer {} ({})", record.label(), address);
            return record.clone();
        }

        let record = PeerRecord::new(address.to_string(), display_name.map(str::to_string));
        info!("Discovered new peer: {} ({})", record.label(), address);
        self.peers.insert(address.to_string(), record.clone());
        record
    }

    /// Store the latest position reported by a known peer.
    /// Unknown peers are logged and ignored.
    pub fn record_location(&mut self, address: &str, point: GeoPoint) -> bool {
        match self.peers.get_mut(address) {
            Some(record) => {
                let now = Utc::now();
                record.last_location = Some(point);
                record.location_updated = Some(now);
                record.last_seen = now;
                true
            }
            None => {
                warn!(
                    "Location {}, {} from undiscovered peer {} ignored",
                    point.latitude, point.longitude, address
                );
                false
            }
        }
    }

    /// Remember the role a known peer advertises
    pub fn set_role(&mut self, address: &str, role: Role) -> bool {
        match self.peers.get_mut(address) {
            Some(record) => {
                if record.role != Some(role) {
                    debug!("Peer {} advertises role {}", record.label(), role);
                    record.role = Some(role);
                }
                true
            }
            None => false,
        }
    }

    pub fn role_of(&self, address: &str) -> Option<Role> {
        self.peers.get(address).and_then(|record| record.role)
    }

    /// Move a peer towards `state`, inserting any skipped intermediate state.
    /// Returns the states applied, or `None` when the peer is unknown.
    pub fn set_connection_state(
        &mut self,
        address: &str,
        state: ConnectionState,
    ) -> Option<Vec<ConnectionState>> {
        let Some(record) = self.peers.get_mut(address) else {
            warn!("Connection state {:?} for unknown peer {} ignored", state, address);
            return None;
        };

        let current = record.connection_state;
        if let Err(err) = current.transition(state) {
            if current != state {
                debug!("Peer {}: {}, correcting", address, err);
            }
        }

        let path = current.path_to(state);
        if path.is_empty() && current != state {
            warn!("Peer {} cannot return to {:?} from {:?}", address, state, current);
        }

        if let Some(last) = path.last() {
            record.connection_state = *last;
            record.touch();
            debug!("Peer {} connection state: {:?} via {:?}", record.label(), last, path);
        }

        Some(path)
    }

    /// Count an inbound message from a peer
    pub fn record_message(&mut self, address: &str) -> bool {
        match self.peers.get_mut(address) {
            Some(record) => {
                record.message_count += 1;
                record.touch();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, address: &str) -> Option<PeerRecord> {
        self.peers.get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn state_of(&self, address: &str) -> Option<ConnectionState> {
        self.peers.get(address).map(|record| record.connection_state)
    }

    /// Point-in-time copy ordered by first discovery
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.peers.values().cloned().collect();
        records.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.address.cmp(&b.address))
        });
        records
    }

    /// Last known positions of peers heard from within `window`
    pub fn fresh_locations(&self, now: DateTime<Utc>, window: Duration) -> Vec<(PeerAddress, GeoPoint)> {
        self.snapshot()
            .into_iter()
            .filter(|record| !record.is_stale(now, window))
            .filter_map(|record| record.last_location.map(|point| (record.address, point)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget every peer (session teardown)
    pub fn clear(&mut self) {
        if !self.peers.is_empty() {
            debug!("Clearing {} peer records", self.peers.len());
        }
        self.peers.clear();
    }

    pub fn statistics(&self) -> RegistryStatistics {
        RegistryStatistics {
            total_peers: self.peers.len(),
            connected_peers: self
                .peers
                .values()
                .filter(|record| record.connection_state.is_connected())
                .count(),
            located_peers: self
                .peers
                .values()
                .filter(|record| record.last_location.is_some())
                .count(),
        }
    }
}
