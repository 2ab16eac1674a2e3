/// Integration tests: hosts on loopback TCP.
///
/// Covers the topology request/response exchange between real hosts,
/// loopback sends, connection handling, pending expiry and the close
/// lifecycle.
use std::sync::Arc;
use std::time::Duration;

use arbor_overlay::{
    Host, HostConfig, OverlayError, Packet, ProtocolId, ProtocolMessage, ProtocolMsg,
    ProtocolRegistry, RequestRoster, RequestTree, Roster, RosterId, RoundId, ServiceId,
    ServiceRegistry, Token, TreeId, TreeNodeId,
};
use arbor_transport::KeyPair;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

async fn host(config: HostConfig) -> Host {
    Host::bind(
        KeyPair::generate(),
        "127.0.0.1:0",
        Arc::new(ProtocolRegistry::new()),
        &ServiceRegistry::new(),
        config,
    )
    .await
    .unwrap()
}

async fn next_packet(host: &Host) -> arbor_overlay::Inbound {
    tokio::time::timeout(Duration::from_secs(5), host.receive())
        .await
        .expect("timed out waiting for a packet")
        .expect("host closed")
}

#[derive(Serialize, Deserialize)]
struct Ping;

impl ProtocolMessage for Ping {
    const NAME: &'static str = "host_test.Ping";
}

/// A host that does not know a roster answers with an explicit empty
/// response; once the roster is registered it answers with the roster.
#[tokio::test]
async fn roster_request_empty_then_real() {
    init_tracing();
    let a = host(HostConfig::new()).await;
    let b = host(HostConfig::new()).await;
    b.listen().await.unwrap();
    b.start_processing();

    let roster = Arc::new(Roster::new(vec![a.entity().clone(), b.entity().clone()]));
    let req = Packet::RequestRoster(RequestRoster {
        roster_id: roster.id(),
    });

    a.send_raw(b.entity(), req.clone()).await.unwrap();
    let reply = next_packet(&a).await;
    assert_eq!(reply.from.id(), b.entity().id());
    match reply.packet {
        Packet::SendRoster(r) => {
            assert_eq!(r.roster_id, roster.id());
            assert!(r.roster.is_none());
        }
        other => panic!("expected SendRoster, got {}", other.kind()),
    }

    b.register_roster(roster.clone()).await;
    a.send_raw(b.entity(), req).await.unwrap();
    match next_packet(&a).await.packet {
        Packet::SendRoster(r) => {
            let got = r.roster.expect("roster should be known now");
            assert_eq!(got.id(), roster.id());
            assert_eq!(got.list(), roster.list());
            assert_eq!(got.aggregate(), roster.aggregate());
        }
        other => panic!("expected SendRoster, got {}", other.kind()),
    }

    assert!(a.is_connected(&b.entity().id()));
    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn tree_request_returns_marshal() {
    init_tracing();
    let a = host(HostConfig::new()).await;
    let b = host(HostConfig::new()).await;
    b.listen().await.unwrap();
    b.start_processing();

    let roster = Arc::new(Roster::new(vec![a.entity().clone(), b.entity().clone()]));
    let tree = Arc::new(roster.generate_binary_tree().unwrap());
    b.register_tree(tree.clone()).await;

    let req = Packet::RequestTree(RequestTree { tree_id: tree.id() });
    a.send_raw(b.entity(), req).await.unwrap();
    match next_packet(&a).await.packet {
        Packet::SendTree(r) => {
            let marshal = r.tree.expect("tree should be known");
            let rebuilt = marshal.make_tree(roster.clone()).unwrap();
            assert!(rebuilt == *tree);
        }
        other => panic!("expected SendTree, got {}", other.kind()),
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn send_to_self_loops_back() {
    init_tracing();
    let a = host(HostConfig::new()).await;
    let tree_id = TreeId::from_uuid(Uuid::new_v4());
    a.send_raw(a.entity(), Packet::RequestTree(RequestTree { tree_id }))
        .await
        .unwrap();

    let item = next_packet(&a).await;
    assert_eq!(item.from.id(), a.entity().id());
    assert!(matches!(item.packet, Packet::RequestTree(r) if r.tree_id == tree_id));
    assert_eq!(a.status().connections, 0);
    a.close().await.unwrap();
}

/// Data for a tree nobody knows is parked, the sender answers the tree
/// request with an empty marker, and the sweep finally evicts the data.
#[tokio::test]
async fn unresolvable_data_is_evicted() {
    init_tracing();
    let config = HostConfig::new()
        .pending_timeout(Duration::from_millis(200))
        .pending_sweep_interval(Duration::from_millis(50));
    let a = host(config.clone()).await;
    let b = host(config).await;
    a.listen().await.unwrap();
    b.listen().await.unwrap();
    a.start_processing();
    b.start_processing();

    let to = Token::new(
        RosterId::random(),
        TreeId::from_uuid(Uuid::new_v4()),
        ProtocolId::from_name("missing"),
        ServiceId::nil(),
        RoundId::random(),
        TreeNodeId::from_uuid(Uuid::new_v4()),
    );
    let msg = ProtocolMsg::new(to.clone(), to, &Ping).unwrap();
    a.send_raw(b.entity(), Packet::Data(msg)).await.unwrap();

    let parked = tokio::time::timeout(Duration::from_secs(5), async {
        while b.status().overlay.pending.data == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(parked.is_ok(), "data was never parked");

    let evicted = tokio::time::timeout(Duration::from_secs(5), async {
        while b.status().overlay.pending.data != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "pending data was never evicted");

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn close_is_reported_once() {
    init_tracing();
    let a = host(HostConfig::new()).await;
    a.listen().await.unwrap();
    a.start_processing();

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move { a.wait_for_close().await })
    };
    a.close().await.unwrap();
    assert!(matches!(a.close().await, Err(OverlayError::AlreadyClosing)));
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("wait_for_close did not resolve")
        .unwrap();
    assert!(a.is_closing());
    assert!(a.receive().await.is_none());
}

#[tokio::test]
async fn bind_conflict_is_fatal() {
    init_tracing();
    let a = host(HostConfig::new()).await;
    let taken = a.entity().address().to_string();
    let b = Host::new(
        KeyPair::generate(),
        &taken,
        Arc::new(ProtocolRegistry::new()),
        &ServiceRegistry::new(),
        HostConfig::new(),
    )
    .unwrap();

    // `a` holds the port through its listener even before listening.
    let err = b.listen().await.unwrap_err();
    assert!(matches!(
        err,
        OverlayError::Transport(arbor_transport::TransportError::Bind { .. })
    ));
    a.close().await.unwrap();
}

/// A peer that opens TCP and never speaks must not hold up anyone else's
/// handshake.
#[tokio::test]
async fn silent_peer_does_not_block_other_connections() {
    init_tracing();
    let a = host(HostConfig::new()).await;
    let b = host(HostConfig::new()).await;
    b.listen().await.unwrap();

    let _silent = tokio::net::TcpStream::connect(b.entity().address())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let connected = tokio::time::timeout(Duration::from_secs(3), a.connect(b.entity())).await;
    assert!(matches!(connected, Ok(Ok(()))), "honest connect was held up");
    assert!(a.is_connected(&b.entity().id()));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_connects_share_one_connection() {
    init_tracing();
    let a = host(HostConfig::new()).await;
    let b = host(HostConfig::new()).await;
    b.listen().await.unwrap();

    let (first, second) = tokio::join!(a.connect(b.entity()), a.connect(b.entity()));
    first.unwrap();
    second.unwrap();
    assert_eq!(a.status().connections, 1);

    let accepted = tokio::time::timeout(Duration::from_secs(2), async {
        while b.status().connections == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(accepted.is_ok(), "b never registered the connection");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.status().connections, 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Sending to ourselves never waits on our own inbound queue.
#[tokio::test]
async fn loopback_send_fails_fast_when_inbound_is_full() {
    init_tracing();
    let a = host(HostConfig::new().inbound_buffer(1)).await;
    let tree_id = TreeId::from_uuid(Uuid::new_v4());
    let packet = Packet::RequestTree(RequestTree { tree_id });

    a.send_raw(a.entity(), packet.clone()).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), a.send_raw(a.entity(), packet))
        .await
        .expect("loopback send waited on a full queue");
    assert!(matches!(second, Err(OverlayError::InboundFull)));

    let item = next_packet(&a).await;
    assert!(matches!(item.packet, Packet::RequestTree(r) if r.tree_id == tree_id));
    a.close().await.unwrap();
}
