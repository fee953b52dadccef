//! Peer exchange responder — answers "who do you know?".
//!
//! The answer is the registry minus the requester. Entries stale for longer
//! than the grace period are left out so dead nodes stop circulating;
//! younger stale entries are still sent (flagged unreachable) but sorted
//! last, so they are the first to go when the response is truncated.

use std::collections::HashSet;
use std::time::Duration;

use meshwatch_core::config::DiscoveryConfig;
use meshwatch_core::{NodeId, PeerListEntry};
use tokio::time::Instant;

use crate::registry::{Endpoint, EndpointRegistry};

#[derive(Debug, Clone)]
pub struct PeerExchangeResponder {
    stale_grace: Duration,
    /// 0 = unlimited.
    max_entries: usize,
}

impl PeerExchangeResponder {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            stale_grace: config.stale_grace(),
            max_entries: config.max_peers_per_response,
        }
    }

    /// Build the peer list for `requester`.
    ///
    /// Refreshes the requester's last-seen time if it is known: asking is
    /// proof of life. An empty registry yields an empty list.
    pub fn respond(&self, registry: &EndpointRegistry, requester: &NodeId) -> Vec<PeerListEntry> {
        registry.touch(requester);
        let snapshot = registry.snapshot(requester);
        self.filter(snapshot, Instant::now())
    }

    fn filter(&self, snapshot: Vec<Endpoint>, now: Instant) -> Vec<PeerListEntry> {
        let mut seen = HashSet::new();
        let mut live = Vec::new();
        let mut stale = Vec::new();

        for endpoint in snapshot {
            if !seen.insert(endpoint.identity.clone()) {
                continue;
            }
            match endpoint.stale_for(now) {
                Some(d) if d > self.stale_grace => continue,
                Some(d) => stale.push((d, endpoint)),
                None => live.push(endpoint),
            }
        }

        // Freshest stale entries first among the stale ones.
        stale.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.identity.cmp(&b.1.identity)));

        let entries = live
            .iter()
            .chain(stale.iter().map(|(_, e)| e))
            .map(Endpoint::to_peer_list_entry);

        if self.max_entries > 0 {
            entries.take(self.max_entries).collect()
        } else {
            entries.collect()
        }
    }
}
