//! The seam between discovery and the transport/session layer.
//!
//! The transport owns connections, framing and authentication. Discovery
//! only needs to be told about endpoints and sessions, to receive payloads
//! for the methods it registered, and to send payloads by identity.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use meshwatch_core::{EndpointAddress, NodeId};

use crate::adapter::SessionEventAdapter;

/// Opaque token for the virtual endpoint a component presents to the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointHandle {
    /// Transport-assigned token.
    pub token: u64,
    /// Identity peers see for this endpoint.
    pub identity: NodeId,
    /// Address peers can dial, if the transport has one.
    pub address: Option<EndpointAddress>,
}

/// Everything discovery needs from the transport.
///
/// Calls must not block: `connect` starts an attempt and returns, and the
/// outcome arrives later as a session-established notification (or never,
/// which the engine treats as a timeout).
pub trait Transport: Send + Sync {
    /// Claim a virtual endpoint under `identity`.
    fn acquire_endpoint(&self, identity: &NodeId) -> Result<EndpointHandle>;

    /// Give the endpoint back. Must be safe to call once per acquire.
    fn release_endpoint(&self, endpoint: &EndpointHandle);

    /// Deliver new-endpoint and session notifications for `endpoint`.
    fn subscribe(&self, endpoint: &EndpointHandle, adapter: SessionEventAdapter);

    /// Route inbound messages carrying `method` to `adapter`.
    fn register_handler(&self, endpoint: &EndpointHandle, method: &'static str, adapter: SessionEventAdapter);

    /// Drop every subscription and handler registered for `endpoint`.
    fn unsubscribe(&self, endpoint: &EndpointHandle);

    /// Begin an outbound session. No-op if one already exists either way.
    fn connect(&self, from: &EndpointHandle, peer: &NodeId, address: &EndpointAddress) -> Result<()>;

    /// Fire a payload at a peer with a live session.
    fn send(&self, from: &EndpointHandle, peer: &NodeId, payload: Bytes) -> Result<()>;
}

/// Scoped ownership of a virtual endpoint.
///
/// Dropping the lease unsubscribes every handler and releases the endpoint,
/// so a component that is dropped without `stop()` still cleans up.
pub struct EndpointLease {
    transport: Arc<dyn Transport>,
    handle: EndpointHandle,
}

impl EndpointLease {
    pub fn acquire(transport: Arc<dyn Transport>, identity: &NodeId) -> Result<Self> {
        let handle = transport.acquire_endpoint(identity)?;
        tracing::debug!(endpoint = %handle.identity, token = handle.token, "discovery endpoint acquired");
        Ok(Self { transport, handle })
    }

    pub fn handle(&self) -> &EndpointHandle {
        &self.handle
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.transport.unsubscribe(&self.handle);
        self.transport.release_endpoint(&self.handle);
        tracing::debug!(endpoint = %self.handle.identity, token = self.handle.token, "discovery endpoint released");
    }
}
