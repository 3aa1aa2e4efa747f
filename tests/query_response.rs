//! End-to-end test: two local services communicating through their
//! overlay nodes. Service X behind node A queries service Y behind node
//! B; Y answers; X receives the answer as a response correlated to its
//! original query.

use std::sync::Arc;
use std::time::Duration;

use causeway::{Header, LocalBus, LocalPort, MemStore, MsgType, OverlayServer};
use tokio::time::timeout;

const SERVICE_Y_ID: u32 = 31_415_926;
const PORT_X: LocalPort = LocalPort(100);
const PORT_Y: LocalPort = LocalPort(200);

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_node(bus: Arc<LocalBus>) -> Arc<OverlayServer> {
    let store = Arc::new(MemStore::new());
    OverlayServer::bind("127.0.0.1:0", bus, LocalPort(1), store)
        .await
        .expect("bind failed")
}

#[tokio::test]
async fn query_and_response_cross_the_overlay() {
    // Each node gets its own bus, standing in for a separate host.
    let bus_a = Arc::new(LocalBus::new());
    let bus_b = Arc::new(LocalBus::new());
    let node_a = spawn_node(bus_a.clone()).await;
    let node_b = spawn_node(bus_b.clone()).await;

    let mut service_x = bus_a.attach(PORT_X).await;
    let mut service_y = bus_b.attach(PORT_Y).await;

    // Service Y registers with its overlay so inbound queries can be
    // routed to it.
    bus_b
        .send(
            PORT_Y,
            node_b.bus_port(),
            Header::new(MsgType::RegisterService, SERVICE_Y_ID.to_le_bytes().to_vec()),
        )
        .await;

    // Node A needs to know node B before it can send the handshake.
    node_a
        .add_node(node_b.verifying_key().await, node_b.local_addr())
        .await;

    // X fires the query. No session exists yet: the overlay defers the
    // send behind a handshake transparently.
    let query_id = bus_a.next_query_id();
    let mut query = Header::query(MsgType::Test, query_id, b"query_from_A".to_vec());
    query.service = SERVICE_Y_ID;
    query.addr = Some(node_b.local_addr());
    bus_a.send(PORT_X, node_a.bus_port(), query).await;

    // Y receives exactly the query body, marked network-originated.
    let inbound = timeout(RECV_TIMEOUT, service_y.recv())
        .await
        .expect("timed out waiting for query at Y")
        .expect("bus closed");
    assert_eq!(inbound.header.body, b"query_from_A");
    assert_eq!(inbound.header.msg_type, MsgType::Test);
    assert!(inbound.header.is_query());
    assert!(inbound.header.from_net());
    let sender = inbound.header.node_id.expect("sender identity stamped");
    assert_eq!(sender, node_a.identity().await);
    assert!(inbound.header.addr.is_some());

    // Y answers over the same path; the response rides the recorded
    // correlation id back to X.
    let reply = inbound.header.respond(b"resp_from_B".to_vec());
    bus_b.send(PORT_Y, node_b.bus_port(), reply).await;

    let answer = timeout(RECV_TIMEOUT, service_x.recv())
        .await
        .expect("timed out waiting for response at X")
        .expect("bus closed");
    assert_eq!(answer.header.body, b"resp_from_B");
    assert!(answer.header.is_response());
    assert!(!answer.header.is_query());
    assert_eq!(answer.header.id, query_id, "response must correlate to the query");

    // The exchange negotiated TTLs on both sides along the way.
    let a_at_b = node_b
        .node_by_identity(&node_a.identity().await)
        .await
        .expect("B should know A");
    let b_at_a = node_a
        .node_by_identity(&node_b.identity().await)
        .await
        .expect("A should know B");
    for _ in 0..500 {
        if a_at_b.read().await.ttl > Duration::ZERO && b_at_a.read().await.ttl > Duration::ZERO {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(a_at_b.read().await.ttl > Duration::ZERO);
    assert!(b_at_a.read().await.ttl > Duration::ZERO);
}

#[tokio::test]
async fn large_random_body_crosses_uncompressed() {
    use rand::RngCore;

    let bus_a = Arc::new(LocalBus::new());
    let bus_b = Arc::new(LocalBus::new());
    let node_a = spawn_node(bus_a.clone()).await;
    let node_b = spawn_node(bus_b.clone()).await;

    let mut service_y = bus_b.attach(PORT_Y).await;
    bus_b
        .send(
            PORT_Y,
            node_b.bus_port(),
            Header::new(MsgType::RegisterService, SERVICE_Y_ID.to_le_bytes().to_vec()),
        )
        .await;

    node_a
        .add_node(node_b.verifying_key().await, node_b.local_addr())
        .await;

    // Random data defeats gzip, so the transport keeps the plain
    // encoding; either way the body must arrive byte-identical.
    let mut body = vec![0u8; 1000];
    rand::rngs::OsRng.fill_bytes(&mut body);

    let mut msg = Header::query(MsgType::Test, bus_a.next_query_id(), body.clone());
    msg.service = SERVICE_Y_ID;
    msg.addr = Some(node_b.local_addr());
    bus_a.send(PORT_X, node_a.bus_port(), msg).await;

    let inbound = timeout(RECV_TIMEOUT, service_y.recv())
        .await
        .expect("timed out waiting for message at Y")
        .expect("bus closed");
    assert_eq!(inbound.header.body, body);
}

#[tokio::test]
async fn compressible_body_crosses_intact() {
    let bus_a = Arc::new(LocalBus::new());
    let bus_b = Arc::new(LocalBus::new());
    let node_a = spawn_node(bus_a.clone()).await;
    let node_b = spawn_node(bus_b.clone()).await;

    let mut service_y = bus_b.attach(PORT_Y).await;
    bus_b
        .send(
            PORT_Y,
            node_b.bus_port(),
            Header::new(MsgType::RegisterService, SERVICE_Y_ID.to_le_bytes().to_vec()),
        )
        .await;

    node_a
        .add_node(node_b.verifying_key().await, node_b.local_addr())
        .await;

    // Repetitive text gzips well, so this rides the compressed encoding.
    let body = "the quick brown fox jumps over the lazy dog. ".repeat(40);

    let mut msg = Header::query(MsgType::Test, bus_a.next_query_id(), body.as_bytes().to_vec());
    msg.service = SERVICE_Y_ID;
    msg.addr = Some(node_b.local_addr());
    bus_a.send(PORT_X, node_a.bus_port(), msg).await;

    let inbound = timeout(RECV_TIMEOUT, service_y.recv())
        .await
        .expect("timed out waiting for message at Y")
        .expect("bus closed");
    assert_eq!(inbound.header.body, body.as_bytes());
}

#[tokio::test]
async fn unresolvable_destination_is_dropped() {
    let bus_a = Arc::new(LocalBus::new());
    let node_a = spawn_node(bus_a.clone()).await;
    let mut service_x = bus_a.attach(PORT_X).await;

    // No node is registered for this address; the overlay drops the
    // message instead of retrying.
    let mut msg = Header::query(MsgType::Test, bus_a.next_query_id(), b"void".to_vec());
    msg.service = SERVICE_Y_ID;
    msg.addr = Some("127.0.0.1:1".parse().unwrap());
    bus_a.send(PORT_X, node_a.bus_port(), msg).await;

    // Nothing ever comes back.
    let outcome = timeout(Duration::from_millis(100), service_x.recv()).await;
    assert!(outcome.is_err(), "no response expected for a dropped send");
}
