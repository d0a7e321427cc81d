use super::*;
use crate::packet::DataRecord;
use actix_web::{test, web, App};
use openraft::error::RPCError;
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::VoteRequest;
use openraft::Vote;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;

/// Helper function to reserve a local port the OS considers free
fn free_address() -> NodeAddress {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind probe");
    let port = listener.local_addr().unwrap().port();
    format!("http://127.0.0.1:{port}").parse().unwrap()
}

fn fast_settings(max_consecutive_failures: u32) -> LinkSettings {
    LinkSettings {
        request_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(200),
        max_consecutive_failures,
    }
}

fn options(temp_dir: &TempDir) -> TransportOptions {
    TransportOptions {
        store_path: temp_dir.path().join("db"),
        max_size_bytes: 1024 * 1024,
        max_handles: 16,
        workers: 1,
    }
}

fn create_test_bridge(max_size_bytes: u64) -> (Arc<WriteThroughBridge>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store = KvStore::open(temp_dir.path().join("db"), max_size_bytes, 16).unwrap();
    (Arc::new(WriteThroughBridge::new(Arc::new(store))), temp_dir)
}

// Nothing listens on port 1.
fn dead_address() -> NodeAddress {
    "http://127.0.0.1:1".parse().unwrap()
}

#[tokio::test]
async fn test_pool_reuses_connection() {
    let pool = PeerLinkPool::new(fast_settings(3));
    let peer: NodeAddress = "http://127.0.0.1:9101".parse().unwrap();

    let first = pool.get_or_connect(&peer).await.unwrap();
    let second = pool.get_or_connect(&peer).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.len().await, 1);
}

#[tokio::test]
async fn test_pool_keeps_one_link_per_peer() {
    let pool = PeerLinkPool::new(fast_settings(3));
    let a: NodeAddress = "http://127.0.0.1:9101".parse().unwrap();
    let b: NodeAddress = "http://127.0.0.1:9102".parse().unwrap();

    let link_a = pool.get_or_connect(&a).await.unwrap();
    let link_b = pool.get_or_connect(&b).await.unwrap();

    assert!(!Arc::ptr_eq(&link_a, &link_b));
    assert_eq!(link_a.address(), &a);
    assert_eq!(link_b.address(), &b);
    assert_eq!(pool.len().await, 2);
}

#[tokio::test]
async fn test_pool_evicts_after_consecutive_failures() {
    let pool = PeerLinkPool::new(fast_settings(2));
    let peer = dead_address();
    let packet = Packet::Data(DataRecord::new("k", "v"));

    let original = pool.get_or_connect(&peer).await.unwrap();

    assert!(pool.send(&peer, &packet).await.is_err());
    assert!(pool.contains(&peer).await);
    assert_eq!(original.consecutive_failures(), 1);

    assert!(pool.send(&peer, &packet).await.is_err());
    assert!(!pool.contains(&peer).await);

    // The next use opens a fresh link
    let replacement = pool.get_or_connect(&peer).await.unwrap();
    assert!(!Arc::ptr_eq(&original, &replacement));
    assert_eq!(replacement.consecutive_failures(), 0);
}

#[tokio::test]
async fn test_pool_never_evicts_when_disabled() {
    let pool = PeerLinkPool::new(fast_settings(0));
    let peer = dead_address();
    let packet = Packet::Data(DataRecord::new("k", "v"));

    let link = pool.get_or_connect(&peer).await.unwrap();
    for _ in 0..3 {
        let result = pool.send(&peer, &packet).await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }

    assert!(pool.contains(&peer).await);
    assert_eq!(link.consecutive_failures(), 3);
}

#[tokio::test]
async fn test_write_before_initialize_fails() {
    let transport = HttpTransport::new(free_address(), fast_settings(3));
    let result = transport
        .write(&dead_address(), Packet::Data(DataRecord::new("k", "v")))
        .await;

    assert!(matches!(result, Err(TransportError::NotInitialized)));
    assert!(transport.pool().is_empty().await);
}

#[actix_web::test]
async fn test_initialize_runs_once() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let transport = HttpTransport::new(free_address(), fast_settings(3));

    let attached = transport.initialize(options(&temp_dir)).await.unwrap();
    assert_eq!(attached.inbound, InboundStatus::Bound);

    let second = transport.initialize(options(&temp_dir)).await;
    assert!(matches!(second, Err(TransportError::AlreadyInitialized)));

    transport.shutdown().await;
}

#[actix_web::test]
async fn test_bind_failure_keeps_node_usable() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let address: NodeAddress = format!("http://127.0.0.1:{port}").parse().unwrap();

    let transport = HttpTransport::new(address, fast_settings(3));
    let attached = transport.initialize(options(&temp_dir)).await.unwrap();

    assert!(matches!(attached.inbound, InboundStatus::Unbound { .. }));
    // The store is attached regardless
    attached.store.set("still", "works").unwrap();
    assert_eq!(attached.store.get("still").unwrap().as_deref(), Some("works"));
}

#[actix_web::test]
async fn test_store_open_failure_allows_retry() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let blocker = temp_dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let transport = HttpTransport::new(free_address(), fast_settings(3));
    let bad = TransportOptions {
        store_path: blocker.join("db"),
        ..options(&temp_dir)
    };
    assert!(matches!(
        transport.initialize(bad).await,
        Err(TransportError::Store(_))
    ));

    let attached = transport.initialize(options(&temp_dir)).await.unwrap();
    assert_eq!(attached.inbound, InboundStatus::Bound);
    transport.shutdown().await;
}

#[test]
fn test_bridge_applies_and_notifies() {
    let (bridge, _temp_dir) = create_test_bridge(1024 * 1024);
    let mut observer = bridge.subscribe();

    let reply = bridge.apply(DataRecord::new("7", "seven"));

    assert!(matches!(reply, PacketReply::Applied));
    assert_eq!(bridge.store().get("7").unwrap().as_deref(), Some("seven"));
    assert_eq!(
        observer.try_recv().unwrap(),
        DataReceived {
            record: DataRecord::new("7", "seven")
        }
    );
}

#[test]
fn test_bridge_rejects_on_store_error() {
    let (bridge, _temp_dir) = create_test_bridge(16);
    let mut observer = bridge.subscribe();

    let reply = bridge.apply(DataRecord::new("big", "x".repeat(64)));

    assert!(matches!(reply, PacketReply::Rejected { .. }));
    assert!(bridge.store().get("big").unwrap().is_none());
    assert!(observer.try_recv().is_err());
}

#[actix_web::test]
async fn test_inbound_data_packet_is_written_through() {
    let (bridge, _temp_dir) = create_test_bridge(1024 * 1024);
    let state = InboundState::new(bridge.clone(), Arc::new(OnceLock::new()));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(http::configure_inbound),
    )
    .await;

    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri("/packet")
            .set_json(Packet::Data(DataRecord::new("7", "seven")))
            .to_request();
        let reply: PacketReply = test::call_and_read_body_json(&app, req).await;
        assert!(matches!(reply, PacketReply::Applied));
    }

    // Delivering the same record twice leaves the same state
    assert_eq!(bridge.store().get("7").unwrap().as_deref(), Some("seven"));
}

#[actix_web::test]
async fn test_inbound_control_packet_before_engine_attached() {
    let (bridge, _temp_dir) = create_test_bridge(1024 * 1024);
    let state = InboundState::new(bridge.clone(), Arc::new(OnceLock::new()));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(http::configure_inbound),
    )
    .await;

    let vote = VoteRequest::new(Vote::new(1, 42), None);
    let req = test::TestRequest::post()
        .uri("/packet")
        .set_json(Packet::Control(crate::packet::ControlMessage::Vote(vote)))
        .to_request();
    let reply: PacketReply = test::call_and_read_body_json(&app, req).await;

    assert!(matches!(reply, PacketReply::NotReady));
    assert!(bridge.store().get("42").unwrap().is_none());
}

#[actix_web::test]
async fn test_inbound_rejects_malformed_packet() {
    let (bridge, _temp_dir) = create_test_bridge(1024 * 1024);
    let state = InboundState::new(bridge, Arc::new(OnceLock::new()));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(http::configure_inbound),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/packet")
        .set_json(serde_json::json!({"key": "7", "value": "seven"}))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert!(resp.status().is_client_error());
}

#[actix_web::test]
async fn test_write_between_transports() {
    let sender_dir = TempDir::new().expect("Failed to create temp directory");
    let receiver_dir = TempDir::new().expect("Failed to create temp directory");

    let sender = HttpTransport::new(free_address(), fast_settings(3));
    let receiver = HttpTransport::new(free_address(), fast_settings(3));
    sender.initialize(options(&sender_dir)).await.unwrap();
    let attached = receiver.initialize(options(&receiver_dir)).await.unwrap();
    let mut observer = attached.bridge.subscribe();

    let reply = sender
        .write(
            receiver.address(),
            Packet::Data(DataRecord::new("7", "seven")),
        )
        .await
        .unwrap();

    assert!(matches!(reply, PacketReply::Applied));
    assert_eq!(attached.store.get("7").unwrap().as_deref(), Some("seven"));
    assert_eq!(observer.recv().await.unwrap().record.key, "7");
    assert!(sender.pool().contains(receiver.address()).await);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[actix_web::test]
async fn test_network_maps_unattached_engine_to_unreachable() {
    let sender_dir = TempDir::new().expect("Failed to create temp directory");
    let receiver_dir = TempDir::new().expect("Failed to create temp directory");

    let sender = Arc::new(HttpTransport::new(free_address(), fast_settings(3)));
    let receiver = HttpTransport::new(free_address(), fast_settings(3));
    sender.initialize(options(&sender_dir)).await.unwrap();
    receiver.initialize(options(&receiver_dir)).await.unwrap();

    let mut factory = PacketNetworkFactory::new(sender.clone());
    let node = crate::config::Node::from(receiver.address());
    let mut network = factory.new_client(receiver.address().node_id(), &node).await;

    let result = network
        .vote(
            VoteRequest::new(Vote::new(1, 1), None),
            RPCOption::new(Duration::from_secs(1)),
        )
        .await;
    assert!(matches!(result, Err(RPCError::Unreachable(_))));

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn test_network_rejects_invalid_member_address() {
    let transport = Arc::new(HttpTransport::new(free_address(), fast_settings(3)));
    let mut factory = PacketNetworkFactory::new(transport);
    let node = crate::config::Node {
        address: "not-an-address".to_string(),
    };
    let mut network = factory.new_client(5, &node).await;

    let result = network
        .vote(
            VoteRequest::new(Vote::new(1, 1), None),
            RPCOption::new(Duration::from_secs(1)),
        )
        .await;
    assert!(matches!(result, Err(RPCError::Network(_))));
}
