//! Discovery sessions — which peers we currently have a live session with.
//!
//! A session refers to its endpoint by identity only; the registry owns the
//! endpoint record.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;

use meshwatch_core::wire::Direction;
use meshwatch_core::NodeId;

/// Metadata about a live session.
#[derive(Debug, Clone)]
pub struct DiscoverySession {
    pub peer: NodeId,
    /// Who opened it.
    pub direction: Direction,
    pub established_at: Instant,
    /// Last time we asked this peer for its peers.
    pub last_exchange: Option<Instant>,
}

impl DiscoverySession {
    pub fn new(peer: NodeId, direction: Direction) -> Self {
        Self {
            peer,
            direction,
            established_at: Instant::now(),
            last_exchange: None,
        }
    }
}

/// The session table — shared between the engine task and the facade.
pub type SessionTable = Arc<DashMap<NodeId, DiscoverySession>>;

/// Create a new empty session table.
pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}
