//! meshwatch integration test harness.
//!
//! Every test builds a mesh of discovery components on one in-process
//! `MemoryNetwork`. No sockets, no root, no external setup:
//!
//!   cargo test --test integration
//!
//! Components run their engine tasks on the test runtime, so tests yield
//! (`settle`) to let messages flow, and use a paused clock where timing
//! matters.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use meshwatch_core::config::DiscoveryConfig;
use meshwatch_core::wire::methods;
use meshwatch_core::{DiscoveryMessage, NodeId};
use meshwatch_discovery::{
    Component, DiscoveryComponent, DiscoveryEvent, EndpointHandle, MemoryNetwork, Phase,
    SessionEventAdapter, Transport,
};

mod convergence;
mod faults;
mod lifecycle;

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn id(s: &str) -> NodeId {
    NodeId::from(s)
}

/// Let every engine task drain its queue. Messages between in-memory nodes
/// are delivered synchronously, so a bounded number of yields is enough.
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

/// A set of discovery components sharing one in-memory network.
pub struct Mesh {
    pub net: Arc<MemoryNetwork>,
    config: DiscoveryConfig,
    nodes: BTreeMap<String, DiscoveryComponent>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::with_config(DiscoveryConfig::default())
    }

    pub fn with_config(config: DiscoveryConfig) -> Self {
        Self {
            net: Arc::new(MemoryNetwork::new()),
            config,
            nodes: BTreeMap::new(),
        }
    }

    /// Create and start a node.
    pub fn spawn(&mut self, name: &str) -> Result<()> {
        let mut node = DiscoveryComponent::new(
            id(name),
            self.config.clone(),
            self.net.clone() as Arc<dyn Transport>,
        );
        node.start().with_context(|| format!("starting {name}"))?;
        self.nodes.insert(name.to_string(), node);
        Ok(())
    }

    pub fn node(&self, name: &str) -> &DiscoveryComponent {
        &self.nodes[name]
    }

    pub fn node_mut(&mut self, name: &str) -> &mut DiscoveryComponent {
        self.nodes.get_mut(name).expect("node exists")
    }

    /// Make `observer`'s transport report `target` as a new endpoint.
    pub fn introduce(&self, observer: &str, target: &str) {
        self.net.reveal(&id(observer), &id(target));
    }

    pub fn knows(&self, observer: &str, target: &str) -> bool {
        self.node(observer)
            .registry()
            .map_or(false, |r| r.contains(&id(target)))
    }

    pub fn phase(&self, observer: &str, target: &str) -> Option<Phase> {
        self.node(observer)
            .registry()
            .and_then(|r| r.get(&id(target)))
            .map(|e| e.phase)
    }

    pub fn known(&self, observer: &str) -> Vec<String> {
        self.node(observer)
            .peers()
            .into_iter()
            .map(|e| e.identity.to_string())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}

/// A bare endpoint on the network that speaks the wire protocol by hand.
pub struct Probe {
    net: Arc<MemoryNetwork>,
    handle: EndpointHandle,
    events: UnboundedReceiver<DiscoveryEvent>,
}

impl Probe {
    pub fn join(net: &Arc<MemoryNetwork>, name: &str) -> Result<Self> {
        let handle = net.acquire_endpoint(&id(name))?;
        let (adapter, events) = SessionEventAdapter::channel();
        net.subscribe(&handle, adapter.clone());
        for method in methods::ALL {
            net.register_handler(&handle, method, adapter.clone());
        }
        Ok(Self {
            net: net.clone(),
            handle,
            events,
        })
    }

    pub fn dial(&self, target: &str) -> Result<()> {
        self.net
            .connect(&self.handle, &id(target), &MemoryNetwork::address_of(&id(target)))
    }

    pub fn send(&self, to: &str, message: &DiscoveryMessage) -> Result<()> {
        self.send_raw(to, message.to_bytes())
    }

    pub fn send_raw(&self, to: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.net.send(&self.handle, &id(to), payload.into())
    }

    /// Every decodable message received so far.
    pub fn messages(&mut self) -> Vec<(NodeId, DiscoveryMessage)> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let DiscoveryEvent::Message { from, payload } = event {
                if let Ok(message) = DiscoveryMessage::from_bytes(&payload) {
                    out.push((from, message));
                }
            }
        }
        out
    }

    /// The peer list in the last response received from `from`, if any.
    pub fn last_peer_list(&mut self, from: &str) -> Option<Vec<String>> {
        self.messages()
            .into_iter()
            .filter(|(sender, _)| sender.as_str() == from)
            .filter_map(|(_, m)| match m {
                DiscoveryMessage::GetPeersResponse { entries } => Some(
                    entries
                        .into_iter()
                        .map(|e| e.identity.to_string())
                        .collect(),
                ),
                _ => None,
            })
            .last()
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.net.release_endpoint(&self.handle);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Nodes can be created and stopped on a shared network.
#[tokio::test]
async fn test_mesh_harness_starts_nodes() {
    let mut mesh = Mesh::new();
    mesh.spawn("a").unwrap();
    mesh.spawn("b").unwrap();

    assert_eq!(mesh.names(), vec!["a", "b"]);
    assert!(mesh.node("a").is_running());
    assert!(mesh.known("a").is_empty());

    mesh.node_mut("a").stop();
    assert!(!mesh.node("a").is_running());
}
