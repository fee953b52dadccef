//! HTTP status endpoint — exposes discovery state as JSON.

use std::collections::HashMap;

use axum::routing::get;
use axum::{extract::State, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use meshwatch_core::wire::Direction;
use meshwatch_core::{EndpointState, NodeId};
use meshwatch_discovery::{EndpointRegistry, Phase, SessionTable};

#[derive(Clone)]
pub struct StatusState {
    pub identity: NodeId,
    pub registry: EndpointRegistry,
    pub sessions: SessionTable,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub identity: String,
    pub peers_known: usize,
    pub sessions: usize,
    pub phases: HashMap<Phase, usize>,
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        identity: state.identity.to_string(),
        peers_known: state.registry.len(),
        sessions: state.sessions.len(),
        phases: state.registry.phase_counts(),
    })
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize)]
pub struct PeerInfo {
    pub identity: String,
    pub address: Option<String>,
    pub state: EndpointState,
    pub phase: Phase,
    pub last_seen_secs: u64,
    pub stale_secs: Option<u64>,
    pub session: Option<Direction>,
}

async fn handle_peers(State(state): State<StatusState>) -> Json<PeersResponse> {
    let now = tokio::time::Instant::now();
    let peers = state
        .registry
        .all()
        .into_iter()
        .map(|e| PeerInfo {
            identity: e.identity.to_string(),
            address: e.address.as_ref().map(ToString::to_string),
            state: e.state,
            phase: e.phase,
            last_seen_secs: now.saturating_duration_since(e.last_seen).as_secs(),
            stale_secs: e.stale_for(now).map(|d| d.as_secs()),
            session: state.sessions.get(&e.identity).map(|s| s.direction),
        })
        .collect();

    Json(PeersResponse { peers })
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/peers", get(handle_peers))
        .with_state(state)
}

pub async fn serve(state: StatusState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
