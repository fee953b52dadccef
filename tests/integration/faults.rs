use std::time::Duration;

use meshwatch_core::config::DiscoveryConfig;
use meshwatch_core::{DiscoveryMessage, EndpointState};
use meshwatch_discovery::Phase;

use crate::*;

/// A cut link marks the peer stale at once; it stops being handed out after
/// the grace period and is forgotten after the removal timeout.
#[tokio::test(start_paused = true)]
async fn test_partitioned_peer_ages_out() {
    let config = DiscoveryConfig::default();
    let mut mesh = Mesh::new();
    for name in ["x", "y", "z"] {
        mesh.spawn(name).unwrap();
    }
    mesh.introduce("x", "y");
    mesh.introduce("x", "z");
    settle().await;
    assert_eq!(mesh.phase("x", "y"), Some(Phase::Synced));

    mesh.net.partition(&id("x"), &id("y"));
    mesh.net.partition(&id("z"), &id("y"));
    settle().await;
    assert_eq!(mesh.phase("x", "y"), Some(Phase::Stale));

    let mut probe = Probe::join(&mesh.net, "p").unwrap();
    probe.dial("x").unwrap();
    settle().await;
    probe
        .send("x", &DiscoveryMessage::GetPeersRequest { requester: id("p") })
        .unwrap();
    settle().await;
    // Young stale entries are still reported, flagged and listed last.
    assert_eq!(
        probe.last_peer_list("x"),
        Some(vec!["z".to_string(), "y".to_string()])
    );

    tokio::time::advance(config.stale_grace() + Duration::from_secs(1)).await;
    settle().await;
    probe
        .send("x", &DiscoveryMessage::GetPeersRequest { requester: id("p") })
        .unwrap();
    settle().await;
    assert_eq!(probe.last_peer_list("x"), Some(vec!["z".to_string()]));

    tokio::time::advance(config.remove_after()).await;
    settle().await;
    assert!(!mesh.knows("x", "y"));
    assert!(mesh.knows("x", "z"));
}

/// A garbled peer list is dropped without touching the session.
#[tokio::test]
async fn test_malformed_peer_list_keeps_session() {
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();

    let probe = Probe::join(&mesh.net, "y").unwrap();
    probe.dial("x").unwrap();
    settle().await;
    assert_eq!(mesh.phase("x", "y"), Some(Phase::Handshaking));

    probe
        .send_raw("x", &br#"{"method":"discovery::Peers","params":{"entries":"nope"}}"#[..])
        .unwrap();
    settle().await;
    assert!(mesh.net.has_session(&id("x"), &id("y")));
    assert_eq!(mesh.phase("x", "y"), Some(Phase::Handshaking));

    probe
        .send("x", &DiscoveryMessage::GetPeersResponse { entries: vec![] })
        .unwrap();
    settle().await;
    assert_eq!(mesh.phase("x", "y"), Some(Phase::Synced));
}

/// A peer that never answers get-peers goes stale after the request timeout.
#[tokio::test(start_paused = true)]
async fn test_silent_peer_goes_stale() {
    let config = DiscoveryConfig::default();
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();

    let probe = Probe::join(&mesh.net, "y").unwrap();
    probe.dial("x").unwrap();
    settle().await;
    assert_eq!(mesh.phase("x", "y"), Some(Phase::Handshaking));

    tokio::time::advance(config.request_timeout() + Duration::from_millis(10)).await;
    settle().await;

    let y = mesh.node("x").registry().unwrap().get(&id("y")).unwrap();
    assert_eq!(y.phase, Phase::Stale);
    assert_eq!(y.state, EndpointState::Unreachable);
}

/// Gossip about an address nobody answers on ends in a stale entry, not a
/// stuck handshake.
#[tokio::test(start_paused = true)]
async fn test_dead_address_times_out() {
    let config = DiscoveryConfig::default();
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();

    let probe = Probe::join(&mesh.net, "y").unwrap();
    probe.dial("x").unwrap();
    settle().await;
    probe
        .send(
            "x",
            &DiscoveryMessage::GetPeersResponse {
                entries: vec![meshwatch_core::PeerListEntry {
                    identity: id("ghost"),
                    address: Some(MemoryNetwork::address_of(&id("ghost"))),
                    state: EndpointState::Established,
                }],
            },
        )
        .unwrap();
    settle().await;
    assert_eq!(mesh.phase("x", "ghost"), Some(Phase::Handshaking));

    tokio::time::advance(config.handshake_timeout() + Duration::from_millis(10)).await;
    settle().await;
    assert_eq!(mesh.phase("x", "ghost"), Some(Phase::Stale));
}
