//! In-process transport for running whole meshes inside one test.
//!
//! Nodes are addressed as `mem://<identity>`. `connect` establishes the
//! session immediately and notifies both sides; links can be cut or
//! partitioned to exercise timeouts and stale handling.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use bytes::Bytes;

use meshwatch_core::wire::{method_of, Direction};
use meshwatch_core::{EndpointAddress, NodeId};

use crate::adapter::SessionEventAdapter;
use crate::transport::{EndpointHandle, Transport};

struct Node {
    token: u64,
    subscriber: Option<SessionEventAdapter>,
    handlers: HashMap<&'static str, SessionEventAdapter>,
}

#[derive(Default)]
struct Inner {
    next_token: u64,
    nodes: HashMap<NodeId, Node>,
    /// Unordered pairs with a live session.
    sessions: HashSet<(NodeId, NodeId)>,
    /// Unordered pairs that cannot connect.
    partitions: HashSet<(NodeId, NodeId)>,
}

fn pair(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl Inner {
    fn notify(&self, node: &NodeId, f: impl FnOnce(&SessionEventAdapter)) {
        if let Some(adapter) = self.nodes.get(node).and_then(|n| n.subscriber.as_ref()) {
            f(adapter);
        }
    }

    fn holds(&self, endpoint: &EndpointHandle) -> bool {
        self.nodes.get(&endpoint.identity).map(|n| n.token) == Some(endpoint.token)
    }

    fn close(&mut self, a: &NodeId, b: &NodeId) -> bool {
        if !self.sessions.remove(&pair(a, b)) {
            return false;
        }
        self.notify(a, |s| {
            s.on_session_closed(b.clone());
        });
        self.notify(b, |s| {
            s.on_session_closed(a.clone());
        });
        true
    }
}

/// A shared, in-memory "network". Wrap in an `Arc` and hand to every node.
#[derive(Default)]
pub struct MemoryNetwork {
    inner: Mutex<Inner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address a node with this identity would be reachable at.
    pub fn address_of(identity: &NodeId) -> EndpointAddress {
        EndpointAddress::new(format!("mem://{identity}"))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `observer`'s transport report a new endpoint, as a real transport
    /// would on hearing from an unknown address.
    pub fn reveal(&self, observer: &NodeId, identity: &NodeId) {
        let address = Self::address_of(identity);
        self.lock().notify(observer, |s| {
            s.on_new_endpoint(identity.clone(), address);
        });
    }

    pub fn has_session(&self, a: &NodeId, b: &NodeId) -> bool {
        self.lock().sessions.contains(&pair(a, b))
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Drop the session between `a` and `b`, notifying both.
    pub fn disconnect(&self, a: &NodeId, b: &NodeId) -> bool {
        self.lock().close(a, b)
    }

    /// Cut the link: close any session and refuse future ones.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        let mut inner = self.lock();
        inner.partitions.insert(pair(a, b));
        inner.close(a, b);
    }

    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.lock().partitions.remove(&pair(a, b));
    }

    /// Deliver a raw payload to `to` as if `from` sent it, session or not.
    pub fn inject(&self, from: &NodeId, to: &NodeId, payload: Bytes) -> bool {
        let inner = self.lock();
        let Some(method) = method_of(&payload) else {
            return false;
        };
        match inner.nodes.get(to).and_then(|n| n.handlers.get(method.as_str())) {
            Some(handler) => handler.on_message(from.clone(), payload),
            None => false,
        }
    }
}

impl Transport for MemoryNetwork {
    fn acquire_endpoint(&self, identity: &NodeId) -> Result<EndpointHandle> {
        let mut inner = self.lock();
        if inner.nodes.contains_key(identity) {
            bail!("endpoint {identity} already claimed");
        }
        inner.next_token += 1;
        let token = inner.next_token;
        inner.nodes.insert(
            identity.clone(),
            Node {
                token,
                subscriber: None,
                handlers: HashMap::new(),
            },
        );
        Ok(EndpointHandle {
            token,
            identity: identity.clone(),
            address: Some(Self::address_of(identity)),
        })
    }

    fn release_endpoint(&self, endpoint: &EndpointHandle) {
        let mut inner = self.lock();
        if !inner.holds(endpoint) {
            return;
        }
        let peers: Vec<NodeId> = inner
            .sessions
            .iter()
            .filter_map(|(a, b)| {
                if a == &endpoint.identity {
                    Some(b.clone())
                } else if b == &endpoint.identity {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        for peer in peers {
            inner.close(&endpoint.identity, &peer);
        }
        inner.nodes.remove(&endpoint.identity);
    }

    fn subscribe(&self, endpoint: &EndpointHandle, adapter: SessionEventAdapter) {
        if let Some(node) = self.lock().nodes.get_mut(&endpoint.identity) {
            node.subscriber = Some(adapter);
        }
    }

    fn register_handler(&self, endpoint: &EndpointHandle, method: &'static str, adapter: SessionEventAdapter) {
        if let Some(node) = self.lock().nodes.get_mut(&endpoint.identity) {
            node.handlers.insert(method, adapter);
        }
    }

    fn unsubscribe(&self, endpoint: &EndpointHandle) {
        if let Some(node) = self.lock().nodes.get_mut(&endpoint.identity) {
            node.subscriber = None;
            node.handlers.clear();
        }
    }

    fn connect(&self, from: &EndpointHandle, peer: &NodeId, address: &EndpointAddress) -> Result<()> {
        let mut inner = self.lock();
        if !inner.holds(from) {
            bail!("endpoint {} was released", from.identity);
        }
        let Some(target) = address.as_str().strip_prefix("mem://").map(NodeId::from) else {
            bail!("not a memory address: {address}");
        };
        if &target != peer {
            tracing::debug!(expected = %peer, found = %target, "address belongs to another node");
        }
        let key = pair(&from.identity, &target);
        // Unknown target or cut link: the attempt just never completes.
        if !inner.nodes.contains_key(&target)
            || inner.partitions.contains(&key)
            || inner.sessions.contains(&key)
        {
            return Ok(());
        }

        inner.sessions.insert(key);
        inner.notify(&from.identity, |s| {
            s.on_session_established(target.clone(), Direction::Outbound);
        });
        inner.notify(&target, |s| {
            s.on_session_established(from.identity.clone(), Direction::Inbound);
        });
        Ok(())
    }

    fn send(&self, from: &EndpointHandle, peer: &NodeId, payload: Bytes) -> Result<()> {
        let inner = self.lock();
        if !inner.holds(from) || !inner.sessions.contains(&pair(&from.identity, peer)) {
            bail!("no session between {} and {peer}", from.identity);
        }
        let Some(method) = method_of(&payload) else {
            bail!("payload has no method");
        };
        if let Some(handler) = inner.nodes.get(peer).and_then(|n| n.handlers.get(method.as_str())) {
            handler.on_message(from.identity.clone(), payload);
        }
        Ok(())
    }
}
