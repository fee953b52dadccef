use std::time::Duration;

use meshwatch_core::config::DiscoveryConfig;
use meshwatch_core::DiscoveryMessage;
use meshwatch_discovery::Phase;

use crate::*;

/// X starts empty, hears of Y, shakes hands, gets an empty list back and
/// ends with exactly {Y: Synced}.
#[tokio::test]
async fn test_single_peer_reaches_synced() {
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();
    mesh.spawn("y").unwrap();

    mesh.introduce("x", "y");
    settle().await;

    assert_eq!(mesh.known("x"), vec!["y"]);
    assert_eq!(mesh.phase("x", "y"), Some(Phase::Synced));
    assert!(mesh.net.has_session(&id("x"), &id("y")));
    // Y learned X from the inbound session.
    assert_eq!(mesh.known("y"), vec!["x"]);
}

/// A knows B, B knows C. One round-trip between A and B is enough for A to
/// learn about C and reach it.
#[tokio::test]
async fn test_three_nodes_converge_transitively() {
    let mut mesh = Mesh::new();
    for name in ["a", "b", "c"] {
        mesh.spawn(name).unwrap();
    }

    mesh.introduce("b", "c");
    settle().await;
    assert!(!mesh.knows("a", "c"));

    mesh.introduce("a", "b");
    settle().await;

    assert!(mesh.knows("a", "c"));
    assert_eq!(mesh.phase("a", "c"), Some(Phase::Synced));
    assert!(mesh.net.has_session(&id("a"), &id("c")));
    for name in ["a", "b", "c"] {
        assert_eq!(mesh.known(name).len(), 2, "{name} should know the other two");
    }
}

/// A line of nodes where each only hears of its neighbour ends up fully
/// connected once periodic exchanges have run.
#[tokio::test(start_paused = true)]
async fn test_line_topology_converges() {
    let names: Vec<String> = (0..6).map(|i| format!("n{i}")).collect();
    let mut mesh = Mesh::new();
    for name in &names {
        mesh.spawn(name).unwrap();
    }
    for pair in names.windows(2) {
        mesh.introduce(&pair[0], &pair[1]);
    }
    settle().await;

    let interval = DiscoveryConfig::default().exchange_interval();
    for _ in 0..3 {
        tokio::time::advance(interval + Duration::from_secs(1)).await;
        settle().await;
    }

    for name in &names {
        assert_eq!(
            mesh.known(name).len(),
            names.len() - 1,
            "{name} knows {:?}",
            mesh.known(name)
        );
    }
    assert_eq!(mesh.net.session_count(), names.len() * (names.len() - 1) / 2);
}

/// X knows {Y, Z}. A get-peers request from Y is answered with Z only.
#[tokio::test]
async fn test_response_excludes_requester() {
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();
    mesh.spawn("z").unwrap();
    mesh.introduce("x", "z");
    settle().await;

    let mut y = Probe::join(&mesh.net, "y").unwrap();
    y.dial("x").unwrap();
    settle().await;
    assert!(mesh.knows("x", "y"));

    y.send("x", &DiscoveryMessage::GetPeersRequest { requester: id("y") })
        .unwrap();
    settle().await;

    assert_eq!(y.last_peer_list("x"), Some(vec!["z".to_string()]));
}

/// First node in a fresh mesh answers with an empty list.
#[tokio::test]
async fn test_empty_mesh_answers_empty_list() {
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();

    let mut y = Probe::join(&mesh.net, "y").unwrap();
    y.dial("x").unwrap();
    settle().await;

    y.send("x", &DiscoveryMessage::GetPeersRequest { requester: id("y") })
        .unwrap();
    settle().await;

    assert_eq!(y.last_peer_list("x"), Some(vec![]));
}

/// On session start a node introduces itself before asking for peers.
#[tokio::test]
async fn test_announce_precedes_get_peers() {
    let mut mesh = Mesh::new();
    mesh.spawn("x").unwrap();

    let mut y = Probe::join(&mesh.net, "y").unwrap();
    y.dial("x").unwrap();
    settle().await;

    let methods: Vec<&str> = y.messages().iter().map(|(_, m)| m.method()).collect();
    assert_eq!(methods, vec!["discovery::Announce", "discovery::GetPeers"]);
}
