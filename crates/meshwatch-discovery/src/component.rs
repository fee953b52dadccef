//! Discovery component facade — the lifecycle the hosting daemon sees.
//!
//! `start` claims the discovery endpoint, wires the adapter into the
//! transport and spawns the engine task. `stop` says goodbye to every
//! session, releases the endpoint and forgets the registry. Neither blocks.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use meshwatch_core::config::{DiscoveryConfig, SeedPeer};
use meshwatch_core::wire::methods;
use meshwatch_core::{DiscoveryMessage, NodeId};

use crate::adapter::{DiscoveryEvent, SessionEventAdapter};
use crate::engine::DiscoveryEngine;
use crate::error::DiscoveryError;
use crate::registry::{Endpoint, EndpointRegistry};
use crate::session::{new_session_table, SessionTable};
use crate::transport::{EndpointHandle, EndpointLease, Transport};

/// Name under which the hosting framework registers this component.
pub const COMPONENT_NAME: &str = "discovery";

/// Lifecycle contract shared by everything the daemon hosts.
pub trait Component: Send {
    fn name(&self) -> &'static str;
    fn start(&mut self) -> Result<(), DiscoveryError>;
    fn stop(&mut self);
}

struct Running {
    lease: EndpointLease,
    registry: EndpointRegistry,
    sessions: SessionTable,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

pub struct DiscoveryComponent {
    identity: NodeId,
    config: DiscoveryConfig,
    transport: Arc<dyn Transport>,
    seeds: Vec<SeedPeer>,
    running: Option<Running>,
}

impl DiscoveryComponent {
    pub fn new(identity: NodeId, config: DiscoveryConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            identity,
            config,
            transport,
            seeds: Vec::new(),
            running: None,
        }
    }

    /// Peers to dial right after start.
    pub fn with_seeds(mut self, seeds: Vec<SeedPeer>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn identity(&self) -> &NodeId {
        &self.identity
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The live registry, while running.
    pub fn registry(&self) -> Option<&EndpointRegistry> {
        self.running.as_ref().map(|r| &r.registry)
    }

    pub fn sessions(&self) -> Option<&SessionTable> {
        self.running.as_ref().map(|r| &r.sessions)
    }

    pub fn endpoint(&self) -> Option<&EndpointHandle> {
        self.running.as_ref().map(|r| r.lease.handle())
    }

    /// Point-in-time copy of every known endpoint; empty when stopped.
    pub fn peers(&self) -> Vec<Endpoint> {
        self.registry().map(EndpointRegistry::all).unwrap_or_default()
    }

    fn say_goodbye(&self, running: &Running) {
        let leave = Bytes::from(
            DiscoveryMessage::Leave {
                identity: self.identity.clone(),
            }
            .to_bytes(),
        );
        let peers: Vec<NodeId> = running.sessions.iter().map(|s| s.key().clone()).collect();
        for peer in peers {
            if let Err(e) = self.transport.send(running.lease.handle(), &peer, leave.clone()) {
                tracing::debug!(peer = %peer, error = %e, "leave not delivered");
            }
        }
    }
}

impl Component for DiscoveryComponent {
    fn name(&self) -> &'static str {
        COMPONENT_NAME
    }

    fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.running.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;

        let lease = EndpointLease::acquire(self.transport.clone(), &self.identity)
            .map_err(DiscoveryError::EndpointUnavailable)?;

        let (adapter, events) = SessionEventAdapter::channel();
        self.transport.subscribe(lease.handle(), adapter.clone());
        for method in methods::ALL {
            self.transport.register_handler(lease.handle(), method, adapter.clone());
        }

        let registry = EndpointRegistry::new(self.config.max_entries);
        let sessions = new_session_table();
        let engine = DiscoveryEngine::new(
            lease.handle().clone(),
            self.transport.clone(),
            registry.clone(),
            sessions.clone(),
            self.config.clone(),
        );

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = runtime.spawn(run(engine, events, shutdown_rx, self.config.sweep_interval()));

        for seed in &self.seeds {
            adapter.on_new_endpoint(seed.node_id(), seed.endpoint_address());
        }

        tracing::info!(
            identity = %self.identity,
            seeds = self.seeds.len(),
            "discovery started"
        );

        self.running = Some(Running {
            lease,
            registry,
            sessions,
            shutdown,
            task,
        });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        self.say_goodbye(&running);
        let _ = running.shutdown.send(());
        // The lease unsubscribes and releases on drop.
        let Running {
            lease,
            registry,
            sessions,
            task,
            ..
        } = running;
        drop(lease);
        sessions.clear();
        registry.clear();
        drop(task);

        tracing::info!(identity = %self.identity, "discovery stopped");
    }
}

impl Drop for DiscoveryComponent {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    mut engine: DiscoveryEngine,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    mut shutdown: broadcast::Receiver<()>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                engine.abandon_pending();
                tracing::debug!(identity = %engine.local_identity(), "discovery task shutting down");
                return;
            }

            event = events.recv() => match event {
                Some(event) => engine.handle(event),
                None => return,
            },

            _ = sweep.tick() => {
                engine.sweep();
            }
        }
    }
}
