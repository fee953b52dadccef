use meshwatch_discovery::{Component, DiscoveryError, Phase, Transport};

use crate::*;

/// A node that stops says goodbye; its peers drop it right away instead of
/// waiting for it to go stale.
#[tokio::test]
async fn test_stop_sends_leave() {
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();
    mesh.spawn("y").unwrap();
    mesh.introduce("x", "y");
    settle().await;
    assert!(mesh.knows("x", "y"));

    mesh.node_mut("y").stop();
    settle().await;

    assert!(!mesh.knows("x", "y"));
    assert!(!mesh.net.has_session(&id("x"), &id("y")));
    assert!(mesh.node("y").peers().is_empty());
}

/// Stop gives the endpoint back; the same identity can rejoin and sync.
#[tokio::test]
async fn test_restart_rejoins_mesh() {
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();
    mesh.spawn("y").unwrap();
    mesh.introduce("x", "y");
    settle().await;

    mesh.node_mut("y").stop();
    settle().await;
    mesh.node_mut("y").start().unwrap();
    assert!(mesh.known("y").is_empty());

    mesh.introduce("y", "x");
    settle().await;

    assert_eq!(mesh.phase("y", "x"), Some(Phase::Synced));
    assert!(mesh.knows("x", "y"));
}

/// Losing the endpoint to someone else is the one fatal start error.
#[tokio::test]
async fn test_start_fails_when_identity_taken() {
    let mut mesh = Mesh::new();
    let _squatter = Probe::join(&mesh.net, "x").unwrap();

    let err = mesh.spawn("x").unwrap_err();
    let cause = err.downcast_ref::<DiscoveryError>().expect("discovery error");
    assert!(matches!(cause, DiscoveryError::EndpointUnavailable(_)));
}

/// After stop nothing routes to the old endpoint.
#[tokio::test]
async fn test_stopped_node_is_unreachable() {
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();
    mesh.node_mut("x").stop();

    let probe = Probe::join(&mesh.net, "y").unwrap();
    probe.dial("x").unwrap();
    assert!(!mesh.net.has_session(&id("x"), &id("y")));
    // Identity is free.
    assert!(mesh.net.acquire_endpoint(&id("x")).is_ok());
}
