//! Full-stack convergence: lifecyclers and ring clients running over the
//! embedded gossip KV, no external coordinator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clock::SystemProvider;
use kv::Proto;
use memberlist::{MemberlistConfig, MemberlistKv};
use ring::{
    Desc, DefaultReplicationStrategy, InstanceState, Lifecycler, LifecyclerConfig,
    NoopFlushTransferer, Operation, Ring, RingConfig,
};
use test_helpers::{maybe_start_logging, timeout::FutureTimeout};
use tokio::net::UdpSocket;

const TIMEOUT: Duration = Duration::from_secs(15);
const NUM_TOKENS: usize = 16;

/// One process of the simulated cluster: a gossip KV replica, the
/// lifecycler owning this instance's ring entry, and a ring client reading
/// the converged view.
struct Node {
    kv: Arc<MemberlistKv<Proto<Desc>>>,
    lifecycler: Arc<Lifecycler>,
    ring: Arc<Ring>,
}

async fn random_udp() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("failed to bind UDP socket");
    let addr = socket.local_addr().expect("failed to read local addr");

    (socket, addr)
}

async fn start_node(id: &str, socket: UdpSocket, join: Vec<String>) -> Node {
    let config = MemberlistConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        join,
        pullpush_interval: Duration::from_secs(1),
        tombstone_retention: Duration::from_secs(60),
    };
    let kv = MemberlistKv::start_with_socket(config, Proto::<Desc>::new("ring"), socket)
        .expect("failed to start gossip kv");

    let mut cfg = LifecyclerConfig::new(id, format!("10.0.0.{id}:9000"));
    cfg.num_tokens = NUM_TOKENS;
    cfg.heartbeat_period = Duration::from_millis(100);
    cfg.min_ready_duration = Duration::ZERO;
    cfg.final_sleep = Duration::ZERO;

    let time_provider = Arc::new(SystemProvider::new());
    let lifecycler = Lifecycler::start(
        cfg,
        Arc::clone(&kv) as _,
        Arc::new(NoopFlushTransferer),
        Arc::clone(&time_provider) as _,
    );

    let ring = Ring::start(
        RingConfig::default(),
        Arc::clone(&kv) as _,
        Arc::new(DefaultReplicationStrategy::new()),
        time_provider,
    );

    Node {
        kv,
        lifecycler,
        ring,
    }
}

/// Wait until `node`'s ring view reports exactly `instances` members and
/// the matching token count.
async fn wait_for_members(node: &Node, instances: usize) {
    async {
        loop {
            if node.ring.instance_count() == instances
                && node.ring.token_count() == instances * NUM_TOKENS
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    .with_timeout_panic(TIMEOUT)
    .await
}

/// Three peers started in a chain (each seeded with the previous one)
/// converge to a shared ring: every peer's snapshot reports three members
/// and `3 x num_tokens` tokens, and every peer serves quorum lookups.
#[tokio::test]
async fn test_three_peer_convergence() {
    maybe_start_logging();

    let (a_socket, a_addr) = random_udp().await;
    let (b_socket, b_addr) = random_udp().await;
    let (c_socket, _c_addr) = random_udp().await;

    let a = start_node("1", a_socket, vec![]).await;
    let b = start_node("2", b_socket, vec![a_addr.to_string()]).await;
    let c = start_node("3", c_socket, vec![b_addr.to_string()]).await;

    for node in [&a, &b, &c] {
        wait_for_members(node, 3).await;
    }

    // All three lifecyclers are active and visible everywhere.
    for node in [&a, &b, &c] {
        for id in ["1", "2", "3"] {
            node.ring
                .wait_instance_state(id, InstanceState::Active, TIMEOUT)
                .await
                .expect("instance must be active in every view");
        }
    }

    // Converged placement: every peer can assemble a full write quorum.
    for node in [&a, &b, &c] {
        let set = node.ring.get(12345, Operation::Write).unwrap();
        assert_eq!(set.instances.len(), 3);
        assert_eq!(set.max_errors, 1);
    }
}

/// Gracefully stopping one of three peers converges the remaining views to
/// two members and `2 x num_tokens` tokens, via the LEFT tombstone.
#[tokio::test]
async fn test_graceful_leave_converges() {
    maybe_start_logging();

    let (a_socket, a_addr) = random_udp().await;
    let (b_socket, b_addr) = random_udp().await;
    let (c_socket, _c_addr) = random_udp().await;

    let a = start_node("1", a_socket, vec![]).await;
    let b = start_node("2", b_socket, vec![a_addr.to_string()]).await;
    let c = start_node("3", c_socket, vec![b_addr.to_string()]).await;

    for node in [&a, &b, &c] {
        wait_for_members(node, 3).await;
    }

    // Stop node 3 gracefully; its gossip replica keeps running long enough
    // to spread the departure.
    c.lifecycler.shutdown().await;
    assert_eq!(c.lifecycler.state(), InstanceState::Left);

    for node in [&a, &b] {
        wait_for_members(node, 2).await;
        // The tombstone is visible in the raw view but never counts as a
        // member.
        assert_eq!(node.ring.instance_state("3"), Some(InstanceState::Left));
    }

    // And the survivors' own KV replicas carry the tombstone, not a live
    // entry.
    for node in [&a, &b] {
        let desc = kv::Client::get(&*node.kv, "ring")
            .await
            .unwrap()
            .expect("ring state must exist");
        assert_eq!(desc.get("3").map(|d| d.state()), Some(InstanceState::Left));
    }

    drop(c);
}
