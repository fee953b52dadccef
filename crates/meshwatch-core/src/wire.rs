//! meshwatch wire format — the discovery messages exchanged between nodes.
//!
//! Every message is a JSON object tagged by `method`, with the message body
//! under `params`:
//!
//! ```text
//! {"method":"discovery::GetPeers","params":{"requester":"node-a"}}
//! ```
//!
//! The transport routes on `method` alone (see [`method_of`]) and hands the
//! raw payload to whoever registered for it. Unknown fields are ignored so
//! newer peers can add fields without breaking older ones.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Identities ────────────────────────────────────────────────────────────────

/// Stable, globally unique identifier of a node in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an identity from arbitrary seed bytes (usually the listen address).
    ///
    /// First 8 bytes of the BLAKE3 hash, hex-encoded.
    pub fn fingerprint(seed: &[u8]) -> Self {
        let hash = blake3::hash(seed);
        Self(hex::encode(&hash.as_bytes()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How to reach a node. Owned and interpreted by the transport; discovery
/// only stores and forwards it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointAddress(String);

impl EndpointAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Reachability ──────────────────────────────────────────────────────────────

/// Reachability of an endpoint as last observed by the sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    /// Heard of, never talked to.
    #[default]
    Unknown,
    /// Outbound session attempt in flight.
    Connecting,
    /// Live session.
    Established,
    /// Last attempt failed or the session dropped.
    Unreachable,
}

/// Which side opened a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The peer connected to us.
    Inbound,
    /// We connected to the peer.
    Outbound,
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// One row of a peer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListEntry {
    pub identity: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<EndpointAddress>,
    /// `Unreachable` rows are included so receivers can decide whether to
    /// attempt reconnection themselves.
    #[serde(default)]
    pub state: EndpointState,
}

/// Every message the discovery component sends or accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum DiscoveryMessage {
    /// Ask a peer for everyone it knows.
    #[serde(rename = "discovery::GetPeers")]
    GetPeersRequest { requester: NodeId },

    /// Snapshot of the sender's registry, minus the requester.
    #[serde(rename = "discovery::Peers")]
    GetPeersResponse { entries: Vec<PeerListEntry> },

    /// "This is who I am and where to find me." Sent right after a session
    /// comes up, since inbound sessions do not carry the peer's address.
    #[serde(rename = "discovery::Announce")]
    Announce {
        identity: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<EndpointAddress>,
    },

    /// Graceful departure. Receivers drop the sender from their registry.
    #[serde(rename = "discovery::Leave")]
    Leave { identity: NodeId },
}

/// Method names, in the order the transport should register handlers.
pub mod methods {
    pub const GET_PEERS: &str = "discovery::GetPeers";
    pub const PEERS: &str = "discovery::Peers";
    pub const ANNOUNCE: &str = "discovery::Announce";
    pub const LEAVE: &str = "discovery::Leave";

    pub const ALL: [&str; 4] = [GET_PEERS, PEERS, ANNOUNCE, LEAVE];
}

impl DiscoveryMessage {
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetPeersRequest { .. } => methods::GET_PEERS,
            Self::GetPeersResponse { .. } => methods::PEERS,
            Self::Announce { .. } => methods::ANNOUNCE,
            Self::Leave { .. } => methods::LEAVE,
        }
    }

    /// Serialize to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Plain data with string keys only; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Deserialize)]
struct MethodProbe {
    method: String,
}

/// Read just the `method` field of a payload, for transport dispatch tables.
/// Returns `None` if the payload is not a JSON object with a string method.
pub fn method_of(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<MethodProbe>(payload)
        .ok()
        .map(|p| p.method)
}
