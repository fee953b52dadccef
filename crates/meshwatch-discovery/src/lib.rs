//! meshwatch-discovery — peer discovery and peer-list gossip.
//!
//! A node learns about other nodes from the transport (new endpoints,
//! established sessions) and from the peer lists its peers hand back.
//! Every identity it learns about and has not seen before is treated as a
//! fresh new-endpoint event, so knowledge spreads hop by hop until every
//! reachable node knows every other one.

pub mod adapter;
pub mod component;
pub mod engine;
pub mod error;
pub mod memory;
pub mod registry;
pub mod responder;
pub mod session;
pub mod transport;

pub use adapter::{DiscoveryEvent, SessionEventAdapter};
pub use component::{Component, DiscoveryComponent, COMPONENT_NAME};
pub use engine::DiscoveryEngine;
pub use error::DiscoveryError;
pub use memory::MemoryNetwork;
pub use registry::{Endpoint, EndpointRegistry, Phase, UpsertOutcome};
pub use responder::PeerExchangeResponder;
pub use session::{new_session_table, DiscoverySession, SessionTable};
pub use transport::{EndpointHandle, EndpointLease, Transport};
