//! The ring client: the read side of ring membership.
//!
//! A [`Ring`] watches the descriptor's KV key and republishes every update
//! as an immutable [`Snapshot`] behind an atomic pointer swap. Readers load
//! the pointer once per call and never take a lock, so placement lookups on
//! the hot path scale with reader concurrency and can never observe a
//! half-updated ring.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use clock::TimeProvider;
use kv::Client;
use observability_deps::tracing::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::desc::{Desc, InstanceDesc, InstanceState};
use crate::replication::ReplicationStrategy;
use crate::{Error, Operation};

/// Ring read-side configuration.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// The KV key holding this ring's descriptor.
    pub key: String,

    /// How stale an instance's heartbeat may be before it stops counting as
    /// healthy.
    pub heartbeat_timeout: Duration,

    /// The number of replicas to select per key.
    pub replication_factor: usize,

    /// Spread the replicas of each key across distinct availability zones.
    pub zone_awareness_enabled: bool,

    /// Whether `LEAVING` instances are eligible for [`Operation::Reporting`]
    /// lookups.
    pub reporting_includes_leaving: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            key: "ring".to_string(),
            heartbeat_timeout: Duration::from_secs(60),
            replication_factor: 3,
            zone_awareness_enabled: false,
            reporting_includes_leaving: true,
        }
    }
}

/// An ordered set of replicas for one key, plus the number of them that may
/// fail while the operation still succeeds.
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    /// The instances to contact, in ring walk order.
    pub instances: Vec<InstanceDesc>,

    /// The maximum number of instances that may fail.
    pub max_errors: usize,
}

impl ReplicaSet {
    /// The number of successes required for the operation to succeed.
    pub fn required_success(&self) -> usize {
        self.instances.len() - self.max_errors
    }
}

/// An immutable view of one observed ring state.
///
/// `tokens` holds every live instance's tokens sorted ascending, `owners`
/// the owning instance id at the same index. Equal tokens (possible only
/// transiently, during a join race) sort the lexicographically smaller
/// instance id first, which is therefore the id that wins the placement.
#[derive(Debug, Default)]
struct Snapshot {
    desc: Desc,
    tokens: Vec<u32>,
    owners: Vec<String>,
}

impl Snapshot {
    fn new(desc: Desc) -> Self {
        let mut pairs = desc
            .live_instances()
            .flat_map(|(id, d)| d.tokens.iter().map(move |t| (*t, id.clone())))
            .collect::<Vec<_>>();
        pairs.sort();

        let (tokens, owners) = pairs.into_iter().unzip();
        Self {
            desc,
            tokens,
            owners,
        }
    }
}

/// The read side of a ring: an always-current, lock-free view of the
/// descriptor, answering placement queries.
pub struct Ring {
    cfg: RingConfig,
    strategy: Arc<dyn ReplicationStrategy>,
    time_provider: Arc<dyn TimeProvider>,
    snapshot: ArcSwap<Snapshot>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("key", &self.cfg.key)
            .field("instances", &self.instance_count())
            .finish()
    }
}

impl Ring {
    /// Start a ring client watching `cfg.key` on `kv`.
    ///
    /// The watch stops when the returned [`Ring`] is dropped.
    pub fn start(
        cfg: RingConfig,
        kv: Arc<dyn Client<Desc>>,
        strategy: Arc<dyn ReplicationStrategy>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let ring = Arc::new(Self {
            cfg,
            strategy,
            time_provider,
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            shutdown: CancellationToken::new(),
        });

        // The watch task holds only a weak reference: dropping the last
        // user-held Arc cancels the watch rather than leaking it.
        let weak = Arc::downgrade(&ring);
        let key = ring.cfg.key.clone();
        let shutdown = ring.shutdown.clone();
        tokio::spawn(async move {
            let mut observe = |desc: Desc| match weak.upgrade() {
                Some(ring) => {
                    ring.observe(desc);
                    true
                }
                None => false,
            };
            kv.watch_key(&key, shutdown, &mut observe).await;
            debug!(key, "ring watch stopped");
        });

        ring
    }

    /// Install a new descriptor as the current snapshot.
    fn observe(&self, desc: Desc) {
        info!(
            key = %self.cfg.key,
            instances = desc.instance_count(),
            tokens = desc.token_count(),
            "ring updated"
        );
        self.snapshot.store(Arc::new(Snapshot::new(desc)));
    }

    fn op_eligible(&self, op: Operation, state: InstanceState) -> bool {
        match op {
            Operation::Write => matches!(state, InstanceState::Active),
            Operation::Read => matches!(state, InstanceState::Active | InstanceState::Leaving),
            Operation::Reporting => match state {
                InstanceState::Left => false,
                InstanceState::Leaving => self.cfg.reporting_includes_leaving,
                _ => true,
            },
        }
    }

    fn get_from(&self, snap: &Snapshot, hash: u32, op: Operation) -> Result<ReplicaSet, Error> {
        let n = snap.tokens.len();
        if n == 0 {
            return Err(Error::EmptyRing);
        }

        let rf = self.cfg.replication_factor;
        let start = snap.tokens.partition_point(|t| *t < hash) % n;

        let mut selected: Vec<&str> = Vec::with_capacity(rf);
        let mut zones: Vec<&str> = Vec::with_capacity(rf);
        let mut candidates = Vec::with_capacity(rf);

        for i in 0..n {
            let owner = snap.owners[(start + i) % n].as_str();

            // Each instance may be selected once, however many of its
            // tokens the walk crosses.
            if selected.contains(&owner) {
                continue;
            }

            let desc = snap.desc.get(owner).expect("token owner is in the ring");

            if self.cfg.zone_awareness_enabled && !desc.zone.is_empty() {
                if zones.contains(&desc.zone.as_str()) {
                    continue;
                }
                zones.push(desc.zone.as_str());
            }

            selected.push(owner);
            candidates.push(desc.clone());
            if selected.len() == rf {
                break;
            }
        }

        // Filter by op eligibility before handing to the strategy; the
        // strategy owns the health (heartbeat) filtering.
        candidates.retain(|d| self.op_eligible(op, d.state()));

        let (instances, max_errors) = self.strategy.filter(
            candidates,
            op,
            rf,
            self.cfg.heartbeat_timeout,
            self.cfg.zone_awareness_enabled,
            self.time_provider.now(),
        )?;

        Ok(ReplicaSet {
            instances,
            max_errors,
        })
    }

    /// The replica set for the key hashing to `hash`.
    pub fn get(&self, hash: u32, op: Operation) -> Result<ReplicaSet, Error> {
        let snap = self.snapshot.load();
        self.get_from(&snap, hash, op)
    }

    /// The replica sets for a batch of key hashes, all derived from one
    /// consistent snapshot.
    pub fn batch_get(&self, hashes: &[u32], op: Operation) -> Result<Vec<ReplicaSet>, Error> {
        let snap = self.snapshot.load();
        hashes
            .iter()
            .map(|hash| self.get_from(&snap, *hash, op))
            .collect()
    }

    /// Every op-eligible, healthy instance in the ring - the fan-out set
    /// for broadcast-style queries.
    ///
    /// Tolerates up to `replication_factor / 2` unhealthy instances before
    /// refusing to answer: beyond that, a fan-out would silently miss data.
    pub fn get_all(&self, op: Operation) -> Result<ReplicaSet, Error> {
        let snap = self.snapshot.load();
        let now = self.time_provider.now();

        let mut instances = Vec::new();
        let mut max_errors = (self.cfg.replication_factor / 2) as isize;

        for (_, d) in snap.desc.live_instances() {
            if self.op_eligible(op, d.state()) && d.is_healthy(now, self.cfg.heartbeat_timeout) {
                instances.push(d.clone());
            } else {
                max_errors -= 1;
            }
        }

        if instances.is_empty() || max_errors < 0 {
            return Err(Error::TooManyUnhealthy);
        }

        Ok(ReplicaSet {
            instances,
            max_errors: max_errors as usize,
        })
    }

    /// The number of live instances in the current snapshot.
    pub fn instance_count(&self) -> usize {
        self.snapshot.load().desc.instance_count()
    }

    /// The number of tokens held by live instances in the current snapshot.
    pub fn token_count(&self) -> usize {
        self.snapshot.load().desc.token_count()
    }

    /// The state of `id` in the current snapshot, if registered.
    pub fn instance_state(&self, id: &str) -> Option<InstanceState> {
        self.snapshot.load().desc.get(id).map(|d| d.state())
    }

    /// Block until `id` reports `state` in this ring view, or `timeout`
    /// elapses. A helper for operator tooling and tests.
    pub async fn wait_instance_state(
        &self,
        id: &str,
        state: InstanceState,
        timeout: Duration,
    ) -> Result<(), Error> {
        let poll = async {
            loop {
                if self.instance_state(id) == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::WaitTimeout {
                id: id.to_string(),
                state,
            })
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultReplicationStrategy, ReplicationError};
    use assert_matches::assert_matches;
    use clock::{MockProvider, Time};
    use kv::mem::MemClient;
    use test_helpers::timeout::FutureTimeout;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const NOW: i64 = 1_000_000;

    fn entry(zone: &str, tokens: Vec<u32>, state: InstanceState, heartbeat: i64) -> InstanceDesc {
        InstanceDesc::new(
            "127.0.0.1:0",
            zone,
            tokens,
            state,
            Time::from_timestamp(heartbeat),
            Time::from_timestamp(heartbeat),
        )
    }

    /// Start a ring over an in-memory KV seeded with `desc`, and wait for
    /// the watch to deliver it.
    async fn ring_with(desc: Desc, cfg: RingConfig) -> Arc<Ring> {
        let kv = Arc::new(MemClient::<Desc>::new());
        let expect_tokens = desc.token_count();
        kv.cas(&cfg.key.clone(), &mut move |_| Ok((Some(desc.clone()), true)))
            .await
            .unwrap();

        let ring = Ring::start(
            cfg,
            kv,
            Arc::new(DefaultReplicationStrategy::new()),
            Arc::new(MockProvider::new(Time::from_timestamp(NOW))),
        );

        let wait = {
            let ring = Arc::clone(&ring);
            async move {
                while ring.token_count() != expect_tokens {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                ring
            }
        };
        wait.with_timeout_panic(TIMEOUT).await
    }

    fn three_instance_desc() -> Desc {
        let mut desc = Desc::new();
        desc.insert("a", entry("", vec![100, 400, 700], InstanceState::Active, NOW));
        desc.insert("b", entry("", vec![200, 500, 800], InstanceState::Active, NOW));
        desc.insert("c", entry("", vec![300, 600, 900], InstanceState::Active, NOW));
        desc
    }

    #[tokio::test]
    async fn test_get_quorum_write() {
        let ring = ring_with(three_instance_desc(), RingConfig::default()).await;

        let set = ring.get(150, Operation::Write).unwrap();
        assert_eq!(set.instances.len(), 3);
        assert_eq!(set.max_errors, 1);
        assert_eq!(set.required_success(), 2);
    }

    #[tokio::test]
    async fn test_get_is_pure() {
        let ring = ring_with(three_instance_desc(), RingConfig::default()).await;

        // Placement is a pure function of (snapshot, hash, op).
        let first = ring.get(12345, Operation::Write).unwrap();
        for _ in 0..10 {
            let again = ring.get(12345, Operation::Write).unwrap();
            let addrs =
                |s: &ReplicaSet| s.instances.iter().map(|d| d.tokens.clone()).collect::<Vec<_>>();
            assert_eq!(addrs(&first), addrs(&again));
            assert_eq!(first.max_errors, again.max_errors);
        }
    }

    #[tokio::test]
    async fn test_get_wraps_around() {
        let ring = ring_with(three_instance_desc(), RingConfig::default()).await;

        // A hash beyond the largest token wraps to the smallest.
        let set = ring.get(950, Operation::Write).unwrap();
        assert_eq!(set.instances.len(), 3);
    }

    #[tokio::test]
    async fn test_get_insufficient_live_replicas() {
        let mut desc = Desc::new();
        desc.insert("a", entry("", vec![100], InstanceState::Active, NOW));
        // Dead: heartbeats far older than the timeout.
        desc.insert("b", entry("", vec![200], InstanceState::Active, 1));
        desc.insert("c", entry("", vec![300], InstanceState::Active, 1));

        let ring = ring_with(desc, RingConfig::default()).await;

        let err = ring.get(0, Operation::Write).unwrap_err();
        assert_eq!(
            err.to_string(),
            "at least 2 live replicas required, could only find 1"
        );
    }

    #[tokio::test]
    async fn test_write_excludes_leaving_read_accepts_it() {
        let mut desc = Desc::new();
        desc.insert("a", entry("", vec![100], InstanceState::Active, NOW));
        desc.insert("b", entry("", vec![200], InstanceState::Leaving, NOW));
        desc.insert("c", entry("", vec![300], InstanceState::Active, NOW));

        let ring = ring_with(desc, RingConfig::default()).await;

        let set = ring.get(0, Operation::Write).unwrap();
        assert_eq!(set.instances.len(), 2);

        // Reads still go to the leaving instance - it holds data until its
        // removal completes.
        let set = ring.get(0, Operation::Read).unwrap();
        assert_eq!(set.instances.len(), 3);
    }

    #[tokio::test]
    async fn test_zone_awareness_selects_distinct_zones() {
        let mut desc = Desc::new();
        desc.insert("a1", entry("zone-a", vec![100], InstanceState::Active, NOW));
        desc.insert("a2", entry("zone-a", vec![150], InstanceState::Active, NOW));
        desc.insert("b1", entry("zone-b", vec![200], InstanceState::Active, NOW));
        desc.insert("c1", entry("zone-c", vec![300], InstanceState::Active, NOW));

        let cfg = RingConfig {
            zone_awareness_enabled: true,
            ..Default::default()
        };
        let ring = ring_with(desc, cfg).await;

        let set = ring.get(0, Operation::Write).unwrap();
        assert_eq!(set.instances.len(), 3);

        let mut zones = set
            .instances
            .iter()
            .map(|d| d.zone.clone())
            .collect::<Vec<_>>();
        zones.sort();
        zones.dedup();
        assert_eq!(zones.len(), 3, "every replica must be in a distinct zone");
    }

    #[tokio::test]
    async fn test_equal_tokens_resolve_to_smaller_instance_id() {
        // Two instances claim token 500 - only possible through a join
        // race. The lexicographically smaller id owns the placement.
        let mut desc = Desc::new();
        desc.insert("bbb", entry("", vec![500], InstanceState::Active, NOW));
        desc.insert("aaa", entry("", vec![500], InstanceState::Active, NOW));
        desc.insert("ccc", entry("", vec![900], InstanceState::Active, NOW));

        let cfg = RingConfig {
            replication_factor: 1,
            ..Default::default()
        };
        let ring = ring_with(desc, cfg).await;

        let set = ring.get(450, Operation::Write).unwrap();
        assert_eq!(set.instances.len(), 1);
        assert_eq!(
            ring.snapshot.load().owners,
            vec!["aaa".to_string(), "bbb".to_string(), "ccc".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_ring() {
        let ring = ring_with(Desc::new(), RingConfig::default()).await;
        assert_matches!(ring.get(0, Operation::Read), Err(Error::EmptyRing));
    }

    #[tokio::test]
    async fn test_batch_get() {
        let ring = ring_with(three_instance_desc(), RingConfig::default()).await;

        let sets = ring.batch_get(&[0, 350, 650], Operation::Write).unwrap();
        assert_eq!(sets.len(), 3);
        for set in sets {
            assert_eq!(set.instances.len(), 3);
            assert_eq!(set.max_errors, 1);
        }
    }

    #[tokio::test]
    async fn test_get_all_filters_unhealthy() {
        let mut desc = three_instance_desc();
        desc.insert("d", entry("", vec![950], InstanceState::Active, 1));

        let ring = ring_with(desc, RingConfig::default()).await;

        let set = ring.get_all(Operation::Read).unwrap();
        assert_eq!(set.instances.len(), 3);
        assert_eq!(set.max_errors, 0);
    }

    #[tokio::test]
    async fn test_get_all_too_many_unhealthy() {
        let mut desc = three_instance_desc();
        desc.insert("d", entry("", vec![950], InstanceState::Active, 1));
        desc.insert("e", entry("", vec![960], InstanceState::Active, 1));

        let ring = ring_with(desc, RingConfig::default()).await;

        assert_matches!(
            ring.get_all(Operation::Read),
            Err(Error::TooManyUnhealthy)
        );
    }

    #[tokio::test]
    async fn test_reporting_eligibility_is_configurable() {
        let mut desc = Desc::new();
        desc.insert("a", entry("", vec![100], InstanceState::Joining, NOW));
        desc.insert("b", entry("", vec![200], InstanceState::Leaving, NOW));

        let ring = ring_with(desc.clone(), RingConfig::default()).await;
        let set = ring.get_all(Operation::Reporting).unwrap();
        assert_eq!(set.instances.len(), 2);

        let cfg = RingConfig {
            reporting_includes_leaving: false,
            ..Default::default()
        };
        let ring = ring_with(desc, cfg).await;
        let set = ring.get_all(Operation::Reporting).unwrap();
        assert_eq!(set.instances.len(), 1);
        assert_eq!(set.instances[0].tokens, vec![100]);
    }

    #[tokio::test]
    async fn test_watch_picks_up_updates() {
        let kv = Arc::new(MemClient::<Desc>::new());
        let ring = Ring::start(
            RingConfig::default(),
            Arc::clone(&kv) as Arc<dyn Client<Desc>>,
            Arc::new(DefaultReplicationStrategy::new()),
            Arc::new(MockProvider::new(Time::from_timestamp(NOW))),
        );

        assert_eq!(ring.instance_count(), 0);

        let desc = three_instance_desc();
        kv.cas("ring", &mut move |_| Ok((Some(desc.clone()), true)))
            .await
            .unwrap();

        ring.wait_instance_state("a", InstanceState::Active, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(ring.instance_count(), 3);
        assert_eq!(ring.token_count(), 9);
    }

    #[tokio::test]
    async fn test_wait_instance_state_times_out() {
        let ring = ring_with(Desc::new(), RingConfig::default()).await;
        let err = ring
            .wait_instance_state("ghost", InstanceState::Active, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_matches!(err, Error::WaitTimeout { .. });
    }

    #[test]
    fn test_replication_error_passthrough() {
        // Strategy errors surface verbatim through the ring error type.
        let err = Error::from(ReplicationError::NotEnoughLiveReplicas {
            required: 2,
            found: 1,
        });
        assert_eq!(
            err.to_string(),
            "at least 2 live replicas required, could only find 1"
        );
    }
}
