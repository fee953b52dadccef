//! Discovery error taxonomy.
//!
//! Only `EndpointUnavailable` (and the lifecycle misuse variants) ever leave
//! the component. Everything else is logged where it happens and the node
//! carries on with a partial view of the mesh.

use meshwatch_core::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(NodeId),
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(NodeId),
    #[error("malformed peer list from {from}: {source}")]
    MalformedPeerList {
        from: NodeId,
        #[source]
        source: serde_json::Error,
    },
    #[error("registry full ({capacity} entries), rejected {rejected}")]
    RegistryFull { capacity: usize, rejected: NodeId },
    #[error("failed to acquire discovery endpoint: {0:#}")]
    EndpointUnavailable(anyhow::Error),
    #[error("discovery component already running")]
    AlreadyRunning,
    #[error("discovery component must be started inside a tokio runtime")]
    NoRuntime,
}

impl DiscoveryError {
    /// Log at the level the error deserves. None of these stop the component.
    pub fn log(&self) {
        match self {
            Self::UnknownEndpoint(_) | Self::HandshakeTimeout(_) => {
                tracing::debug!(error = %self, "discovery")
            }
            Self::MalformedPeerList { .. } | Self::RegistryFull { .. } => {
                tracing::warn!(error = %self, "discovery")
            }
            Self::EndpointUnavailable(_) | Self::AlreadyRunning | Self::NoRuntime => {
                tracing::error!(error = %self, "discovery")
            }
        }
    }
}
