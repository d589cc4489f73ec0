//! The ring descriptor: the shared data structure the KV store replicates.
//!
//! # Wire format
//!
//! [`Desc`] and [`InstanceDesc`] are prost types whose field tags and enum
//! values are fixed: descriptors written by historical implementations of
//! this protocol decode correctly, and vice versa. In particular
//! [`InstanceState::Left`] MUST remain wire value 4. Instance maps are
//! `BTreeMap`s so serialisation is deterministic.
//!
//! # Merge semantics
//!
//! [`Desc::merge_with`] implements a CRDT join: per instance, the entry with
//! the newer heartbeat wins; on equal heartbeats the more advanced state
//! (`PENDING < JOINING < ACTIVE < LEAVING < LEFT`) wins; any remaining tie
//! is broken on the entry content so the merge is a max over a total order.
//! The merge is therefore commutative, associative and idempotent - peers
//! applying the same updates in any order converge.
//!
//! Removal travels as a tombstone: a merge committing a local CAS turns
//! entries the CAS deleted into [`InstanceState::Left`] entries without
//! tokens, which dominate ties and propagate until purged by
//! [`Desc::remove_tombstones`] after a grace period.

use std::collections::BTreeMap;
use std::time::Duration;

use clock::{SystemProvider, Time, TimeProvider};
use kv::Mergeable;

/// The replicated ring descriptor: a mapping from instance id to that
/// instance's [`InstanceDesc`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct Desc {
    /// All instances known to the ring, keyed by instance id.
    ///
    /// Entries in state [`InstanceState::Left`] are tombstones, not members.
    #[prost(btree_map = "string, message", tag = "1")]
    pub instances: BTreeMap<String, InstanceDesc>,
}

/// A single instance's entry in the ring.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InstanceDesc {
    /// The instance's advertised (host:port) address.
    #[prost(string, tag = "1")]
    pub addr: String,

    /// The unix-second timestamp of the instance's last heartbeat.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,

    /// The instance's lifecycle state.
    #[prost(enumeration = "InstanceState", tag = "3")]
    pub state: i32,

    // Tags 4 and 5 carried token encodings retired by earlier versions of
    // the wire format and must not be reused.
    /// The tokens owned by this instance, unsorted.
    #[prost(uint32, repeated, tag = "6")]
    pub tokens: Vec<u32>,

    /// The availability zone the instance runs in, if any.
    #[prost(string, tag = "7")]
    pub zone: String,

    /// The unix-second timestamp the instance first registered.
    #[prost(int64, tag = "8")]
    pub registered_timestamp: i64,
}

/// The lifecycle state of a ring instance.
///
/// The wire values are part of the persisted format and intentionally do not
/// follow the lifecycle order; use [`InstanceState::rank`] for the logical
/// progression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum InstanceState {
    /// Registered and serving, the normal state.
    Active = 0,
    /// Gracefully shutting down; still holds data.
    Leaving = 1,
    /// Registered but not yet holding tokens.
    Pending = 2,
    /// Holding tokens, verifying them before becoming active.
    Joining = 3,
    /// A tombstone distributing the fact that an instance was removed.
    /// Ring users never select instances in this state.
    Left = 4,
}

impl InstanceState {
    /// The position of this state in the lifecycle progression, used to
    /// break merge ties between entries with equal heartbeats.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Joining => 1,
            Self::Active => 2,
            Self::Leaving => 3,
            Self::Left => 4,
        }
    }
}

impl InstanceDesc {
    /// Construct an entry for a live instance.
    pub fn new(
        addr: impl Into<String>,
        zone: impl Into<String>,
        tokens: Vec<u32>,
        state: InstanceState,
        heartbeat: Time,
        registered_at: Time,
    ) -> Self {
        Self {
            addr: addr.into(),
            timestamp: heartbeat.timestamp(),
            state: state as i32,
            tokens,
            zone: zone.into(),
            registered_timestamp: registered_at.timestamp(),
        }
    }

    /// The heartbeat as a [`Time`].
    pub fn heartbeat(&self) -> Time {
        Time::from_timestamp(self.timestamp)
    }

    /// True if the last heartbeat is within `timeout` of `now`.
    pub fn is_healthy(&self, now: Time, timeout: Duration) -> bool {
        match now.checked_duration_since(self.heartbeat()) {
            Some(age) => age <= timeout,
            // A heartbeat from the future counts as fresh: the writer's
            // clock is merely ahead of ours.
            None => true,
        }
    }
}

/// The total order used to pick a winner when merging two entries for the
/// same instance.
fn merge_key(d: &InstanceDesc) -> (i64, u8, &str, &str, i64, &[u32]) {
    (
        d.timestamp,
        d.state().rank(),
        d.addr.as_str(),
        d.zone.as_str(),
        d.registered_timestamp,
        &d.tokens,
    )
}

impl Desc {
    /// An empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `id`.
    pub fn insert(&mut self, id: impl Into<String>, instance: InstanceDesc) {
        self.instances.insert(id.into(), instance);
    }

    /// Remove the entry for `id`, returning it if present.
    pub fn remove(&mut self, id: &str) -> Option<InstanceDesc> {
        self.instances.remove(id)
    }

    /// The entry for `id`, if any.
    pub fn get(&self, id: &str) -> Option<&InstanceDesc> {
        self.instances.get(id)
    }

    /// Iterate over the live (non-tombstone) entries.
    pub fn live_instances(&self) -> impl Iterator<Item = (&'_ String, &'_ InstanceDesc)> {
        self.instances
            .iter()
            .filter(|(_, d)| d.state() != InstanceState::Left)
    }

    /// The number of live instances in the ring.
    pub fn instance_count(&self) -> usize {
        self.live_instances().count()
    }

    /// The total number of tokens held by live instances.
    pub fn token_count(&self) -> usize {
        self.live_instances().map(|(_, d)| d.tokens.len()).sum()
    }

    /// Every token held by a live instance, unsorted.
    pub fn all_tokens(&self) -> Vec<u32> {
        self.live_instances()
            .flat_map(|(_, d)| d.tokens.iter().copied())
            .collect()
    }

    /// The tokens of `id` that are also claimed by another live instance,
    /// alongside the claimant. A non-empty result means a join race placed
    /// the same token twice and `id` may need to regenerate.
    pub fn conflicting_tokens(&self, id: &str) -> Vec<(u32, String)> {
        let mine = match self.instances.get(id) {
            Some(d) => &d.tokens,
            None => return vec![],
        };

        let mut conflicts = Vec::new();
        for (other_id, other) in self.live_instances().filter(|(other_id, _)| *other_id != id) {
            for token in &other.tokens {
                if mine.contains(token) {
                    conflicts.push((*token, other_id.clone()));
                }
            }
        }
        conflicts
    }

    /// CRDT-join `incoming` into `self`, returning the sub-descriptor that
    /// changed (the delta to re-broadcast), or `None` for no change.
    ///
    /// With `local_cas` set the merge commits a locally produced update:
    /// entries present in `self` but deleted from `incoming` become LEFT
    /// tombstones stamped with `now`, so the removal propagates to peers
    /// that still carry the live entry.
    pub fn merge_with(&mut self, incoming: Self, local_cas: bool, now: Time) -> Option<Self> {
        let mut delta = Self::default();

        let incoming_ids = local_cas.then(|| {
            incoming
                .instances
                .keys()
                .cloned()
                .collect::<std::collections::BTreeSet<_>>()
        });

        for (id, entry) in incoming.instances {
            let wins = match self.instances.get(&id) {
                Some(current) => merge_key(&entry) > merge_key(current),
                None => true,
            };
            if wins {
                self.instances.insert(id.clone(), entry.clone());
                delta.instances.insert(id, entry);
            }
        }

        if let Some(incoming_ids) = incoming_ids {
            // Everything the update removed becomes a tombstone.
            let removed = self
                .instances
                .iter()
                .filter(|(id, d)| {
                    d.state() != InstanceState::Left && !incoming_ids.contains(*id)
                })
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();

            for id in removed {
                let entry = self
                    .instances
                    .get_mut(&id)
                    .expect("tombstoned instance is known");
                entry.state = InstanceState::Left as i32;
                entry.tokens.clear();
                entry.timestamp = now.timestamp();
                delta.instances.insert(id, entry.clone());
            }
        }

        if delta.instances.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    /// Drop LEFT tombstones written before `limit`.
    pub fn purge_tombstones(&mut self, limit: Time) {
        self.instances.retain(|_, d| {
            d.state() != InstanceState::Left || d.timestamp >= limit.timestamp()
        });
    }
}

impl Mergeable for Desc {
    fn merge(&mut self, incoming: Self, local_cas: bool) -> Option<Self> {
        self.merge_with(incoming, local_cas, SystemProvider::new().now())
    }

    fn merge_content(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    fn remove_tombstones(&mut self, limit: Time) {
        self.purge_tombstones(limit)
    }
}
