//! Discovery protocol engine.
//!
//! Per endpoint: Discovered → Handshaking → Synced, and Stale when nothing
//! has been heard for too long.
//!
//! - A new endpoint is recorded and dialled unless a session already exists.
//! - When a session comes up we announce ourselves and ask for peers.
//! - A peer list moves the sender to Synced; every identity in it we had
//!   never heard of goes through the new-endpoint path, which is how
//!   knowledge spreads across the mesh.
//! - Timeouts and disconnects move endpoints to Stale; long-stale entries
//!   are eventually removed.
//!
//! The engine is synchronous and owned by a single task. Nothing here
//! blocks: outbound attempts are fire-and-forget with a deadline checked
//! by `sweep`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use meshwatch_core::config::DiscoveryConfig;
use meshwatch_core::wire::{methods, method_of, Direction};
use meshwatch_core::{DiscoveryMessage, EndpointAddress, EndpointState, NodeId, PeerListEntry};

use crate::adapter::DiscoveryEvent;
use crate::error::DiscoveryError;
use crate::registry::{EndpointRegistry, Phase};
use crate::responder::PeerExchangeResponder;
use crate::session::{DiscoverySession, SessionTable};
use crate::transport::{EndpointHandle, Transport};

pub struct DiscoveryEngine {
    endpoint: EndpointHandle,
    transport: Arc<dyn Transport>,
    registry: EndpointRegistry,
    sessions: SessionTable,
    responder: PeerExchangeResponder,
    config: DiscoveryConfig,
    /// Outbound session attempts and when they give up.
    pending_handshakes: HashMap<NodeId, Instant>,
    /// Outstanding GetPeers requests and when they give up.
    pending_requests: HashMap<NodeId, Instant>,
}

impl DiscoveryEngine {
    pub fn new(
        endpoint: EndpointHandle,
        transport: Arc<dyn Transport>,
        registry: EndpointRegistry,
        sessions: SessionTable,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            endpoint,
            transport,
            registry,
            sessions,
            responder: PeerExchangeResponder::new(&config),
            config,
            pending_handshakes: HashMap::new(),
            pending_requests: HashMap::new(),
        }
    }

    pub fn local_identity(&self) -> &NodeId {
        &self.endpoint.identity
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn is_handshaking(&self, identity: &NodeId) -> bool {
        self.pending_handshakes.contains_key(identity)
    }

    pub fn is_awaiting_peers(&self, identity: &NodeId) -> bool {
        self.pending_requests.contains_key(identity)
    }

    pub fn handle(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::NewEndpoint { identity, address } => self.on_new_endpoint(identity, address),
            DiscoveryEvent::SessionEstablished { identity, direction } => {
                self.on_session_established(identity, direction)
            }
            DiscoveryEvent::SessionClosed { identity } => self.on_session_closed(&identity),
            DiscoveryEvent::Message { from, payload } => self.on_message(from, &payload),
        }
    }

    // ── Transport notifications ──────────────────────────────────────────────

    pub fn on_new_endpoint(&mut self, identity: NodeId, address: EndpointAddress) {
        if &identity == self.local_identity() {
            tracing::trace!("ignoring new-endpoint event for ourselves");
            return;
        }

        if let Some(known) = self.registry.get(&identity) {
            self.registry.learn_address(&identity, &address);
            if matches!(known.phase, Phase::Handshaking | Phase::Synced) {
                return;
            }
        }

        let state = if self.sessions.contains_key(&identity) {
            EndpointState::Established
        } else {
            EndpointState::Unknown
        };
        match self.registry.upsert(&identity, Some(address.clone()), state) {
            Ok(outcome) => {
                tracing::debug!(peer = %identity, addr = %address, ?outcome, "endpoint discovered");
            }
            Err(e) => {
                e.log();
                return;
            }
        }

        self.initiate_handshake(&identity, &address);
    }

    pub fn on_session_established(&mut self, identity: NodeId, direction: Direction) {
        if &identity == self.local_identity() {
            return;
        }
        self.pending_handshakes.remove(&identity);

        if self.sessions.contains_key(&identity) {
            tracing::trace!(peer = %identity, "duplicate session notification");
            return;
        }

        if let Err(e) = self.registry.upsert(&identity, None, EndpointState::Established) {
            e.log();
            return;
        }
        self.sessions
            .insert(identity.clone(), DiscoverySession::new(identity.clone(), direction));
        // Established stays the gossiped state while the first exchange runs.
        self.record(self.registry.transition(&identity, Phase::Handshaking));

        tracing::info!(peer = %identity, ?direction, "discovery session established");

        let announce = DiscoveryMessage::Announce {
            identity: self.local_identity().clone(),
            address: self.endpoint.address.clone(),
        };
        self.send(&identity, &announce);
        self.request_peers(&identity);
    }

    pub fn on_session_closed(&mut self, identity: &NodeId) {
        self.pending_handshakes.remove(identity);
        self.pending_requests.remove(identity);
        if self.sessions.remove(identity).is_some() {
            tracing::info!(peer = %identity, "discovery session closed");
        }
        self.record(self.registry.mark_unreachable(identity));
    }

    pub fn on_message(&mut self, from: NodeId, payload: &[u8]) {
        let message = match DiscoveryMessage::from_bytes(payload) {
            Ok(m) => m,
            Err(source) => {
                // Bad data is dropped; the session stays up.
                if method_of(payload).as_deref() == Some(methods::PEERS) {
                    DiscoveryError::MalformedPeerList { from, source }.log();
                } else {
                    tracing::warn!(peer = %from, error = %source, "discarding undecodable discovery message");
                }
                return;
            }
        };

        tracing::trace!(peer = %from, method = message.method(), "discovery message");

        match message {
            DiscoveryMessage::GetPeersRequest { requester } => self.on_get_peers(from, requester),
            DiscoveryMessage::GetPeersResponse { entries } => self.on_peers(from, entries),
            DiscoveryMessage::Announce { identity, address } => self.on_announce(from, identity, address),
            DiscoveryMessage::Leave { identity } => self.on_leave(from, identity),
        }
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    fn on_get_peers(&mut self, from: NodeId, requester: NodeId) {
        if requester != from {
            // The transport vouches for `from`; the claimed name is advisory.
            tracing::debug!(peer = %from, claimed = %requester, "requester name mismatch, answering sender");
        }

        if !self.registry.contains(&from) {
            let state = if self.sessions.contains_key(&from) {
                EndpointState::Established
            } else {
                EndpointState::Unknown
            };
            if let Err(e) = self.registry.upsert(&from, None, state) {
                e.log();
            }
        }

        let entries = self.responder.respond(&self.registry, &from);
        tracing::debug!(peer = %from, count = entries.len(), "answering get-peers");
        self.send(&from, &DiscoveryMessage::GetPeersResponse { entries });
    }

    fn on_peers(&mut self, from: NodeId, entries: Vec<PeerListEntry>) {
        if self.pending_requests.remove(&from).is_none() {
            tracing::debug!(peer = %from, "unsolicited peer list");
        }

        if self.sessions.contains_key(&from) {
            if !self.registry.contains(&from) {
                // Evicted while stale; the live session brings it back.
                if let Err(e) = self.registry.upsert(&from, None, EndpointState::Established) {
                    e.log();
                }
            }
            self.record(self.registry.transition(&from, Phase::Synced));
        } else {
            self.registry.touch(&from);
        }

        let mut learned = 0usize;
        for entry in entries {
            if &entry.identity == self.local_identity() || entry.identity == from {
                continue;
            }

            if self.registry.contains(&entry.identity) {
                if let Some(address) = &entry.address {
                    self.registry.learn_address(&entry.identity, address);
                }
                continue;
            }

            learned += 1;
            match entry.address {
                Some(address)
                    if entry.state != EndpointState::Unreachable || self.config.reconnect_unreachable =>
                {
                    self.on_new_endpoint(entry.identity, address);
                }
                address => {
                    // Nothing to dial (or told not to): remember it and move on.
                    if let Err(e) = self.registry.upsert(&entry.identity, address, EndpointState::Unknown) {
                        e.log();
                    }
                }
            }
        }

        if learned > 0 {
            tracing::info!(peer = %from, learned, known = self.registry.len(), "learned peers");
        }
    }

    fn on_announce(&mut self, from: NodeId, identity: NodeId, address: Option<EndpointAddress>) {
        if identity != from {
            tracing::warn!(peer = %from, claimed = %identity, "ignoring announce for another identity");
            return;
        }
        let state = if self.sessions.contains_key(&from) {
            EndpointState::Established
        } else {
            EndpointState::Unknown
        };
        match self.registry.upsert(&from, address, state) {
            Ok(_) => tracing::debug!(peer = %from, "peer announced"),
            Err(e) => e.log(),
        }
    }

    fn on_leave(&mut self, from: NodeId, identity: NodeId) {
        if identity != from {
            tracing::warn!(peer = %from, claimed = %identity, "ignoring leave for another identity");
            return;
        }
        self.pending_handshakes.remove(&from);
        self.pending_requests.remove(&from);
        self.sessions.remove(&from);
        if self.registry.remove(&from).is_some() {
            tracing::info!(peer = %from, "peer left the mesh");
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Expire deadlines, re-ask sessions for peers, and age the registry.
    pub fn sweep(&mut self) {
        let now = Instant::now();

        for peer in drain_expired(&mut self.pending_handshakes, now) {
            DiscoveryError::HandshakeTimeout(peer.clone()).log();
            self.record(self.registry.mark_unreachable(&peer));
        }
        for peer in drain_expired(&mut self.pending_requests, now) {
            DiscoveryError::HandshakeTimeout(peer.clone()).log();
            self.record(self.registry.mark_unreachable(&peer));
        }

        let interval = self.config.exchange_interval();
        let due: Vec<NodeId> = self
            .sessions
            .iter()
            .filter(|s| !self.pending_requests.contains_key(s.key()))
            .filter(|s| {
                s.last_exchange
                    .map_or(true, |at| now.saturating_duration_since(at) >= interval)
            })
            .map(|s| s.key().clone())
            .collect();
        for peer in due {
            self.request_peers(&peer);
        }

        let expired = self
            .registry
            .expire(self.config.stale_timeout(), self.config.remove_after());
        for peer in &expired.staled {
            tracing::debug!(peer = %peer, "endpoint went stale");
        }
        for peer in &expired.removed {
            self.sessions.remove(peer);
            tracing::info!(peer = %peer, "stale endpoint removed");
        }
    }

    /// Forget every in-flight attempt. Late replies are handled as unsolicited.
    pub fn abandon_pending(&mut self) {
        let handshakes = self.pending_handshakes.len();
        let requests = self.pending_requests.len();
        self.pending_handshakes.clear();
        self.pending_requests.clear();
        if handshakes + requests > 0 {
            tracing::debug!(handshakes, requests, "abandoned pending discovery attempts");
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn initiate_handshake(&mut self, identity: &NodeId, address: &EndpointAddress) {
        if self.sessions.contains_key(identity) || self.pending_handshakes.contains_key(identity) {
            return;
        }

        match self.transport.connect(&self.endpoint, identity, address) {
            Ok(()) => {
                let deadline = Instant::now() + self.config.handshake_timeout();
                self.pending_handshakes.insert(identity.clone(), deadline);
                self.record(self.registry.transition(identity, Phase::Handshaking));
                tracing::debug!(peer = %identity, addr = %address, "handshake initiated");
            }
            Err(e) => {
                tracing::warn!(peer = %identity, addr = %address, error = %e, "connect failed");
                self.record(self.registry.mark_unreachable(identity));
            }
        }
    }

    fn request_peers(&mut self, peer: &NodeId) {
        let request = DiscoveryMessage::GetPeersRequest {
            requester: self.local_identity().clone(),
        };
        if !self.send(peer, &request) {
            return;
        }
        let now = Instant::now();
        self.pending_requests
            .insert(peer.clone(), now + self.config.request_timeout());
        if let Some(mut session) = self.sessions.get_mut(peer) {
            session.last_exchange = Some(now);
        }
    }

    fn send(&self, peer: &NodeId, message: &DiscoveryMessage) -> bool {
        let payload = Bytes::from(message.to_bytes());
        match self.transport.send(&self.endpoint, peer, payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(peer = %peer, method = message.method(), error = %e, "send failed");
                false
            }
        }
    }

    fn record(&self, result: Result<(), DiscoveryError>) {
        if let Err(e) = result {
            e.log();
        }
    }
}

fn drain_expired(pending: &mut HashMap<NodeId, Instant>, now: Instant) -> Vec<NodeId> {
    let mut expired: Vec<NodeId> = pending
        .iter()
        .filter(|(_, deadline)| **deadline <= now)
        .map(|(peer, _)| peer.clone())
        .collect();
    for peer in &expired {
        pending.remove(peer);
    }
    expired.sort();
    expired
}
