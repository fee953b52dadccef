//! Endpoint registry — every node this node knows about.
//!
//! One entry per identity. Mutations take the write lock for the duration
//! of a single entry change; `snapshot` copies the whole table under the
//! read lock, so readers never see a half-applied upsert.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use meshwatch_core::{EndpointAddress, EndpointState, NodeId, PeerListEntry};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::DiscoveryError;

/// Where an endpoint sits in the discovery protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Learned about, not yet contacted.
    Discovered,
    /// Session attempt or peer exchange in flight.
    Handshaking,
    /// Session up and at least one peer list received.
    Synced,
    /// No successful interaction within the stale timeout.
    Stale,
}

impl Phase {
    /// The reachability state gossiped for an endpoint entering this phase.
    /// `Discovered` has no opinion and keeps whatever was recorded.
    fn implied_state(self) -> Option<EndpointState> {
        match self {
            Phase::Discovered => None,
            Phase::Handshaking => Some(EndpointState::Connecting),
            Phase::Synced => Some(EndpointState::Established),
            Phase::Stale => Some(EndpointState::Unreachable),
        }
    }
}

/// A known endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub identity: NodeId,
    /// None until someone tells us how to reach it (inbound sessions).
    pub address: Option<EndpointAddress>,
    pub state: EndpointState,
    pub phase: Phase,
    /// Last successful interaction.
    pub last_seen: Instant,
    /// When the entry went stale. None while live.
    pub stale_since: Option<Instant>,
}

impl Endpoint {
    fn new(identity: NodeId, address: Option<EndpointAddress>, state: EndpointState, now: Instant) -> Self {
        Self {
            identity,
            address,
            state,
            phase: Phase::Discovered,
            last_seen: now,
            stale_since: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.phase == Phase::Stale
    }

    /// How long the entry has been stale, if it is.
    pub fn stale_for(&self, now: Instant) -> Option<Duration> {
        self.stale_since.map(|since| now.saturating_duration_since(since))
    }

    pub fn to_peer_list_entry(&self) -> PeerListEntry {
        PeerListEntry {
            identity: self.identity.clone(),
            address: self.address.clone(),
            state: self.state,
        }
    }

    fn go_stale(&mut self, now: Instant) {
        self.phase = Phase::Stale;
        self.state = EndpointState::Unreachable;
        self.stale_since.get_or_insert(now);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry. `evicted` names the stale entry dropped to make room.
    Inserted { evicted: Option<NodeId> },
    Updated,
}

/// Result of one expiry pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    /// Went stale during this pass.
    pub staled: Vec<NodeId>,
    /// Stale long enough to be dropped.
    pub removed: Vec<NodeId>,
}

/// Shared handle to the endpoint table. Cloning shares the table.
#[derive(Clone, Debug, Default)]
pub struct EndpointRegistry {
    entries: Arc<RwLock<HashMap<NodeId, Endpoint>>>,
    /// 0 = unbounded.
    capacity: usize,
}

impl EndpointRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    // A panic while holding the lock cannot leave an entry half-written:
    // every mutation below replaces or edits a single entry in place.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Endpoint>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Endpoint>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or update an entry and refresh its last-seen time.
    ///
    /// A `None` address keeps whatever address was already known. Upserting
    /// a stale entry with any state other than `Unreachable` revives it to
    /// `Discovered`; upserting with `Unreachable` makes it stale. Fails only
    /// when the registry is at capacity, the identity is new, and no stale
    /// entry can be evicted.
    pub fn upsert(
        &self,
        identity: &NodeId,
        address: Option<EndpointAddress>,
        state: EndpointState,
    ) -> Result<UpsertOutcome, DiscoveryError> {
        let now = Instant::now();
        let mut entries = self.write();

        if let Some(entry) = entries.get_mut(identity) {
            if address.is_some() {
                entry.address = address;
            }
            entry.last_seen = now;
            if state == EndpointState::Unreachable {
                entry.go_stale(now);
            } else {
                entry.state = state;
                if entry.is_stale() {
                    entry.phase = Phase::Discovered;
                    entry.stale_since = None;
                }
            }
            return Ok(UpsertOutcome::Updated);
        }

        let mut evicted = None;
        if self.capacity > 0 && entries.len() >= self.capacity {
            let victim = entries
                .values()
                .filter(|e| e.is_stale())
                .min_by_key(|e| e.last_seen)
                .map(|e| e.identity.clone());
            match victim {
                Some(victim) => {
                    entries.remove(&victim);
                    tracing::debug!(evicted = %victim, "registry full, evicted stale endpoint");
                    evicted = Some(victim);
                }
                None => {
                    return Err(DiscoveryError::RegistryFull {
                        capacity: self.capacity,
                        rejected: identity.clone(),
                    });
                }
            }
        }

        let mut entry = Endpoint::new(identity.clone(), address, state, now);
        if state == EndpointState::Unreachable {
            entry.go_stale(now);
        }
        entries.insert(identity.clone(), entry);
        Ok(UpsertOutcome::Inserted { evicted })
    }

    /// Move an entry to `phase`, updating its reachability state to match.
    ///
    /// Entering `Synced` counts as a successful interaction and refreshes
    /// last-seen. Entering `Stale` records when it happened; any other phase
    /// clears that.
    pub fn transition(&self, identity: &NodeId, phase: Phase) -> Result<(), DiscoveryError> {
        let now = Instant::now();
        let mut entries = self.write();
        let entry = entries
            .get_mut(identity)
            .ok_or_else(|| DiscoveryError::UnknownEndpoint(identity.clone()))?;

        if phase == Phase::Stale {
            entry.go_stale(now);
            return Ok(());
        }

        entry.phase = phase;
        entry.stale_since = None;
        if entry.state == EndpointState::Unreachable {
            entry.state = EndpointState::Unknown;
        }
        // A live session stays Established while its first exchange runs.
        let keep_established = phase == Phase::Handshaking && entry.state == EndpointState::Established;
        if let Some(state) = phase.implied_state().filter(|_| !keep_established) {
            entry.state = state;
        }
        if phase == Phase::Synced {
            entry.last_seen = now;
        }
        Ok(())
    }

    /// Flag an entry unreachable. The entry stays so it can still be
    /// reported (flagged) to peers that ask.
    pub fn mark_unreachable(&self, identity: &NodeId) -> Result<(), DiscoveryError> {
        self.transition(identity, Phase::Stale)
    }

    /// Record that `identity` just did something. Returns false if unknown.
    pub fn touch(&self, identity: &NodeId) -> bool {
        match self.write().get_mut(identity) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Fill in an address for an entry that has none. Returns true if set.
    pub fn learn_address(&self, identity: &NodeId, address: &EndpointAddress) -> bool {
        match self.write().get_mut(identity) {
            Some(entry) if entry.address.is_none() => {
                entry.address = Some(address.clone());
                true
            }
            _ => false,
        }
    }

    /// Point-in-time copy of every entry except `excluding`, ordered by identity.
    pub fn snapshot(&self, excluding: &NodeId) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self
            .read()
            .values()
            .filter(|e| &e.identity != excluding)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    /// Point-in-time copy of every entry, ordered by identity.
    pub fn all(&self) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self.read().values().cloned().collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    pub fn get(&self, identity: &NodeId) -> Option<Endpoint> {
        self.read().get(identity).cloned()
    }

    pub fn contains(&self, identity: &NodeId) -> bool {
        self.read().contains_key(identity)
    }

    /// Delete an entry. Only for graceful leaves and long-stale expiry.
    pub fn remove(&self, identity: &NodeId) -> Option<Endpoint> {
        self.write().remove(identity)
    }

    /// Stale out quiet entries, drop long-stale ones.
    pub fn expire(&self, stale_timeout: Duration, remove_after: Duration) -> Expired {
        let now = Instant::now();
        let mut expired = Expired::default();
        let mut entries = self.write();

        for entry in entries.values_mut() {
            if !entry.is_stale() && now.saturating_duration_since(entry.last_seen) >= stale_timeout {
                entry.go_stale(now);
                expired.staled.push(entry.identity.clone());
            }
        }

        entries.retain(|id, entry| {
            let drop = entry.stale_for(now).is_some_and(|d| d >= remove_after);
            if drop {
                expired.removed.push(id.clone());
            }
            !drop
        });

        expired.staled.sort();
        expired.removed.sort();
        expired
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Entry counts per phase, for status reporting.
    pub fn phase_counts(&self) -> HashMap<Phase, usize> {
        let mut counts = HashMap::new();
        for entry in self.read().values() {
            *counts.entry(entry.phase).or_insert(0) += 1;
        }
        counts
    }
}
