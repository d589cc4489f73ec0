use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kv::{Client, Mergeable, Proto};
use memberlist::{MemberlistConfig, MemberlistKv};
use test_helpers::{maybe_start_logging, timeout::FutureTimeout};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

/// A grow-only map taking the maximum value per key: trivially commutative,
/// associative and idempotent, which is all the store requires of a value.
#[derive(Clone, PartialEq, prost::Message)]
struct TestMap {
    #[prost(btree_map = "string, int64", tag = "1")]
    entries: BTreeMap<String, i64>,
}

impl Mergeable for TestMap {
    fn merge(&mut self, incoming: Self, _local_cas: bool) -> Option<Self> {
        let mut delta = Self::default();
        for (key, value) in incoming.entries {
            let current = self.entries.entry(key.clone()).or_insert(i64::MIN);
            if value > *current {
                *current = value;
                delta.entries.insert(key, value);
            }
        }

        (!delta.entries.is_empty()).then_some(delta)
    }

    fn merge_content(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn remove_tombstones(&mut self, _limit: clock::Time) {}
}

/// Bind a UDP socket on a random port and return it alongside the socket
/// address.
async fn random_udp() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("failed to bind UDP socket");
    let addr = socket.local_addr().expect("failed to read local addr");

    (socket, addr)
}

fn start_node(socket: UdpSocket, join: Vec<String>) -> Arc<MemberlistKv<Proto<TestMap>>> {
    let config = MemberlistConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        join,
        pullpush_interval: Duration::from_secs(1),
        tombstone_retention: Duration::from_secs(60),
    };

    MemberlistKv::start_with_socket(config, Proto::<TestMap>::new("test-map"), socket)
        .expect("failed to start gossip kv")
}

fn map(entries: &[(&str, i64)]) -> TestMap {
    TestMap {
        entries: entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
    }
}

/// Wait until `node` holds a value for `key` matching `predicate`.
async fn wait_for_value<F>(node: &MemberlistKv<Proto<TestMap>>, key: &str, mut predicate: F)
where
    F: FnMut(&TestMap) -> bool,
{
    async {
        loop {
            if let Some(v) = node.get(key).await.expect("get never fails") {
                if predicate(&v) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    .with_timeout_panic(TIMEOUT)
    .await
}

/// A CAS on one node becomes visible on a directly connected peer.
#[tokio::test]
async fn test_two_node_replication() {
    maybe_start_logging();

    let (a_socket, a_addr) = random_udp().await;
    let (b_socket, b_addr) = random_udp().await;

    let a = start_node(a_socket, vec![b_addr.to_string()]);
    let b = start_node(b_socket, vec![a_addr.to_string()]);

    a.cas("config", &mut |_| Ok((Some(map(&[("x", 1)])), true)))
        .await
        .unwrap();

    wait_for_value(&b, "config", |v| v.entries.get("x") == Some(&1)).await;

    // And the reverse direction, merging with what B already knows.
    b.cas("config", &mut |current| {
        let mut new = current.unwrap_or_default();
        new.entries.insert("y".to_string(), 2);
        Ok((Some(new), true))
    })
    .await
    .unwrap();

    wait_for_value(&a, "config", |v| {
        v.entries.get("x") == Some(&1) && v.entries.get("y") == Some(&2)
    })
    .await;
}

/// Three nodes in a chain (A knows B, C knows B) converge on updates from
/// any node, including concurrent writes to the same key.
#[tokio::test]
async fn test_three_node_chain_convergence() {
    maybe_start_logging();

    let (a_socket, _a_addr) = random_udp().await;
    let (b_socket, b_addr) = random_udp().await;
    let (c_socket, _c_addr) = random_udp().await;

    let a = start_node(a_socket, vec![b_addr.to_string()]);
    let b = start_node(b_socket, vec![]);
    let c = start_node(c_socket, vec![b_addr.to_string()]);

    // Concurrent writes to distinct sub-keys from the two chain ends.
    a.cas("state", &mut |_| Ok((Some(map(&[("from-a", 10)])), true)))
        .await
        .unwrap();
    c.cas("state", &mut |_| Ok((Some(map(&[("from-c", 30)])), true)))
        .await
        .unwrap();

    for node in [&a, &b, &c] {
        wait_for_value(node, "state", |v| {
            v.entries.get("from-a") == Some(&10) && v.entries.get("from-c") == Some(&30)
        })
        .await;
    }
}

/// A node that joins after a value was written catches up through the
/// membership-triggered full-state sync.
#[tokio::test]
async fn test_late_joiner_catches_up() {
    maybe_start_logging();

    let (a_socket, a_addr) = random_udp().await;
    let (b_socket, _b_addr) = random_udp().await;

    let a = start_node(a_socket, vec![]);
    a.cas("config", &mut |_| Ok((Some(map(&[("early", 1)])), true)))
        .await
        .unwrap();

    // B starts knowing A only after the write happened.
    let b = start_node(b_socket, vec![a_addr.to_string()]);

    wait_for_value(&b, "config", |v| v.entries.get("early") == Some(&1)).await;
}

/// Watches fire for both local CAS commits and remotely merged updates.
#[tokio::test]
async fn test_watch_key_sees_remote_updates() {
    maybe_start_logging();

    let (a_socket, a_addr) = random_udp().await;
    let (b_socket, b_addr) = random_udp().await;

    let a = start_node(a_socket, vec![b_addr.to_string()]);
    let b = start_node(b_socket, vec![a_addr.to_string()]);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let watcher = {
        let b = Arc::clone(&b);
        tokio::spawn(async move {
            b.watch_key("config", CancellationToken::new(), &mut move |v: TestMap| {
                let done = v.entries.contains_key("fin");
                tx.send(v).expect("watch consumer lives");
                !done
            })
            .await;
        })
    };

    a.cas("config", &mut |_| Ok((Some(map(&[("n", 1)])), true)))
        .await
        .unwrap();
    a.cas("config", &mut |_| Ok((Some(map(&[("fin", 2)])), true)))
        .await
        .unwrap();

    // The watch observes intermediate states in order, ending at "fin".
    let last = async {
        loop {
            let v = rx.recv().await.expect("watch stopped early");
            if v.entries.contains_key("fin") {
                return v;
            }
        }
    }
    .with_timeout_panic(TIMEOUT)
    .await;

    assert_eq!(last.entries.get("fin"), Some(&2));
    watcher.with_timeout_panic(TIMEOUT).await.unwrap();
}

/// The gossip membership epoch is observable for convergence checks.
#[tokio::test]
async fn test_membership_counter() {
    maybe_start_logging();

    let (a_socket, a_addr) = random_udp().await;
    let (b_socket, b_addr) = random_udp().await;

    let a = start_node(a_socket, vec![b_addr.to_string()]);
    let _b = start_node(b_socket, vec![a_addr.to_string()]);

    let mut epoch = a.gossip().membership_epoch();
    epoch
        .wait_for(|&e| e >= 1)
        .with_timeout_panic(TIMEOUT)
        .await
        .expect("gossip stopped");

    assert_eq!(a.gossip().get_peers().await.len(), 1);
}
