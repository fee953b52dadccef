//! meshwatchd — mesh discovery daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use meshwatch_core::config::MeshConfig;
use meshwatch_discovery::{Component, DiscoveryComponent, Transport};

mod status;
mod udp;

use udp::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = MeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshConfig::default()
    });

    if config.discovery.max_peers_per_response > udp::MAX_PEERS_PER_DATAGRAM {
        tracing::warn!(
            configured = config.discovery.max_peers_per_response,
            cap = udp::MAX_PEERS_PER_DATAGRAM,
            "peer list cap lowered to fit one datagram"
        );
        config.discovery.max_peers_per_response = udp::MAX_PEERS_PER_DATAGRAM;
    }

    let identity = config.node.node_id();
    tracing::info!(identity = %identity, listen = %config.node.listen, "meshwatchd starting");

    let transport = Arc::new(
        UdpTransport::bind(&config.node.listen)
            .await
            .context("failed to bind discovery socket")?,
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    // The transport stops after discovery so Leave and Bye still go out.
    let (transport_stop, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut transport_task = tokio::spawn(transport.clone().run(transport_stop.subscribe()));

    let mut discovery = DiscoveryComponent::new(
        identity.clone(),
        config.discovery.clone(),
        transport.clone() as Arc<dyn Transport>,
    )
    .with_seeds(config.seeds.clone());
    discovery
        .start()
        .with_context(|| format!("failed to start {}", discovery.name()))?;

    let (registry, sessions) = match (discovery.registry(), discovery.sessions()) {
        (Some(r), Some(s)) => (r.clone(), s.clone()),
        _ => anyhow::bail!("discovery not running after start"),
    };

    if config.node.status_port != 0 {
        let state = status::StatusState {
            identity: identity.clone(),
            registry: registry.clone(),
            sessions: sessions.clone(),
        };
        let port = config.node.status_port;
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    let membership_printer = {
        let registry = registry.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(
                    known = registry.len(),
                    sessions = sessions.len(),
                    links = transport.session_count(),
                    phases = ?registry.phase_counts(),
                    "membership snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let transport_exited = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            false
        }
        r = &mut transport_task => {
            tracing::error!("transport task exited: {:?}", r);
            true
        }
        r = membership_printer => {
            tracing::error!("membership printer exited: {:?}", r);
            false
        }
    };

    discovery.stop();
    if !transport_exited {
        let _ = transport_stop.send(());
        match transport_task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "transport task failed"),
            Err(e) => tracing::warn!(error = %e, "transport task did not finish"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}
