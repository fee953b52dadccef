//! Session event adapter — turns transport callbacks into discovery events.
//!
//! The transport may call in from any number of I/O tasks at once. Each call
//! just enqueues an event; the engine task drains them one at a time.

use bytes::Bytes;
use tokio::sync::mpsc;

use meshwatch_core::wire::Direction;
use meshwatch_core::{EndpointAddress, NodeId};

/// Everything that can happen to the discovery engine from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// The transport saw an endpoint it had not reported before.
    NewEndpoint { identity: NodeId, address: EndpointAddress },
    /// A session with `identity` is up.
    SessionEstablished { identity: NodeId, direction: Direction },
    /// A session went away (disconnect or transport-level timeout).
    SessionClosed { identity: NodeId },
    /// A payload for one of our registered methods.
    Message { from: NodeId, payload: Bytes },
}

/// Handed to the transport on subscribe / handler registration.
#[derive(Debug, Clone)]
pub struct SessionEventAdapter {
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl SessionEventAdapter {
    pub fn new(tx: mpsc::UnboundedSender<DiscoveryEvent>) -> Self {
        Self { tx }
    }

    /// Create an adapter and the receiving end the engine drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn on_new_endpoint(&self, identity: NodeId, address: EndpointAddress) -> bool {
        self.forward(DiscoveryEvent::NewEndpoint { identity, address })
    }

    pub fn on_session_established(&self, identity: NodeId, direction: Direction) -> bool {
        self.forward(DiscoveryEvent::SessionEstablished { identity, direction })
    }

    pub fn on_session_closed(&self, identity: NodeId) -> bool {
        self.forward(DiscoveryEvent::SessionClosed { identity })
    }

    pub fn on_message(&self, from: NodeId, payload: Bytes) -> bool {
        self.forward(DiscoveryEvent::Message { from, payload })
    }

    /// Returns false once the component has stopped; the event is dropped.
    fn forward(&self, event: DiscoveryEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                tracing::trace!(?event, "discovery stopped, dropping event");
                false
            }
        }
    }
}
