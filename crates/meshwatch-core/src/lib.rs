//! meshwatch-core — identities, wire messages, and configuration.
//! All other meshwatch crates depend on this one.

pub mod config;
pub mod wire;

pub use wire::{DiscoveryMessage, EndpointAddress, EndpointState, NodeId, PeerListEntry};
