//! Replication strategies: pure functions turning a candidate replica list
//! into the set to contact and the number of failures that set tolerates.

use std::time::Duration;

use clock::Time;

use crate::desc::InstanceDesc;
use crate::Operation;

/// Errors produced when a quorum cannot be assembled from the candidates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    /// Too few live candidates to satisfy the required quorum.
    #[error("at least {required} live replicas required, could only find {found}")]
    NotEnoughLiveReplicas {
        /// The quorum size.
        required: usize,
        /// The live candidates available.
        found: usize,
    },

    /// As [`ReplicationError::NotEnoughLiveReplicas`], with zone awareness
    /// enabled.
    #[error(
        "at least {required} live replicas required across different availability zones, \
         could only find {found}"
    )]
    NotEnoughLiveReplicasInZones {
        /// The quorum size.
        required: usize,
        /// The live candidates available.
        found: usize,
    },

    /// No healthy candidate at all.
    #[error("at least {required} healthy replica required, could only find {found}")]
    NotEnoughHealthyReplicas {
        /// The minimum healthy count (always 1 for the ignore-unhealthy
        /// strategy).
        required: usize,
        /// The healthy candidates available.
        found: usize,
    },
}

/// Filters a candidate replica list down to the instances to contact.
///
/// Strategies are pure: they perform no I/O and derive everything from their
/// arguments, so a given ring snapshot always produces the same quorum set.
pub trait ReplicationStrategy: std::fmt::Debug + Send + Sync {
    /// Filter `instances` (the candidates selected by the ring walk for one
    /// key) and return the instances to contact together with the maximum
    /// number of them that may fail while the operation still succeeds.
    #[allow(clippy::too_many_arguments)]
    fn filter(
        &self,
        instances: Vec<InstanceDesc>,
        op: Operation,
        replication_factor: usize,
        heartbeat_timeout: Duration,
        zone_awareness_enabled: bool,
        now: Time,
    ) -> Result<(Vec<InstanceDesc>, usize), ReplicationError>;
}

/// The quorum strategy: a write succeeds when a majority of the replication
/// factor acknowledges it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultReplicationStrategy;

impl DefaultReplicationStrategy {
    /// Construct the default strategy.
    pub fn new() -> Self {
        Self
    }
}

impl ReplicationStrategy for DefaultReplicationStrategy {
    fn filter(
        &self,
        mut instances: Vec<InstanceDesc>,
        _op: Operation,
        replication_factor: usize,
        heartbeat_timeout: Duration,
        zone_awareness_enabled: bool,
        now: Time,
    ) -> Result<(Vec<InstanceDesc>, usize), ReplicationError> {
        // We need a response from a quorum of replicas.
        let min_success = replication_factor / 2 + 1;

        // Skip those that have not heartbeated in a while.
        instances.retain(|i| i.is_healthy(now, heartbeat_timeout));

        // Demand the quorum up front: a doomed operation should not burden
        // the live replicas at all.
        if instances.len() < min_success {
            return Err(if zone_awareness_enabled {
                ReplicationError::NotEnoughLiveReplicasInZones {
                    required: min_success,
                    found: instances.len(),
                }
            } else {
                ReplicationError::NotEnoughLiveReplicas {
                    required: min_success,
                    found: instances.len(),
                }
            });
        }

        let max_errors = instances.len() - min_success;
        Ok((instances, max_errors))
    }
}

/// A strategy accepting any number of healthy instances.
///
/// Used by ring consumers that shard work rather than replicate it (e.g.
/// broadcast-style fan-out), where a single live instance is enough to make
/// progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreUnhealthyInstancesReplicationStrategy;

impl IgnoreUnhealthyInstancesReplicationStrategy {
    /// Construct the strategy.
    pub fn new() -> Self {
        Self
    }
}

impl ReplicationStrategy for IgnoreUnhealthyInstancesReplicationStrategy {
    fn filter(
        &self,
        mut instances: Vec<InstanceDesc>,
        _op: Operation,
        _replication_factor: usize,
        heartbeat_timeout: Duration,
        _zone_awareness_enabled: bool,
        now: Time,
    ) -> Result<(Vec<InstanceDesc>, usize), ReplicationError> {
        instances.retain(|i| i.is_healthy(now, heartbeat_timeout));

        if instances.is_empty() {
            return Err(ReplicationError::NotEnoughHealthyReplicas {
                required: 1,
                found: 0,
            });
        }

        let max_errors = instances.len() - 1;
        Ok((instances, max_errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::InstanceState;

    const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(100);

    /// Build `live` candidates with fresh heartbeats and `dead` candidates
    /// that never heartbeated.
    fn candidates(now: Time, live: usize, dead: usize) -> Vec<InstanceDesc> {
        let mut instances = Vec::new();
        for _ in 0..live {
            instances.push(InstanceDesc::new(
                "",
                "",
                vec![],
                InstanceState::Active,
                now,
                Time::from_timestamp(0),
            ));
        }
        for _ in 0..dead {
            instances.push(InstanceDesc::default());
        }
        instances
    }

    #[test]
    fn test_default_replication_strategy() {
        struct TestCase {
            replication_factor: usize,
            live: usize,
            dead: usize,
            expected_max_failure: usize,
            expected_error: Option<&'static str>,
        }

        let cases = [
            // Works for a single instance, for local testing.
            TestCase {
                replication_factor: 1,
                live: 1,
                dead: 0,
                expected_max_failure: 0,
                expected_error: None,
            },
            TestCase {
                replication_factor: 1,
                live: 0,
                dead: 1,
                expected_max_failure: 0,
                expected_error: Some("at least 1 live replicas required, could only find 0"),
            },
            // Works for RF=3 and 2 instances.
            TestCase {
                replication_factor: 3,
                live: 2,
                dead: 0,
                expected_max_failure: 0,
                expected_error: None,
            },
            // The default production config.
            TestCase {
                replication_factor: 3,
                live: 3,
                dead: 0,
                expected_max_failure: 1,
                expected_error: None,
            },
            TestCase {
                replication_factor: 3,
                live: 2,
                dead: 1,
                expected_max_failure: 0,
                expected_error: None,
            },
            TestCase {
                replication_factor: 3,
                live: 1,
                dead: 2,
                expected_max_failure: 0,
                expected_error: Some("at least 2 live replicas required, could only find 1"),
            },
            // Adding / removing nodes: a node joining or leaving expands the
            // candidate set while the quorum stays tied to the target
            // replication factor.
            TestCase {
                replication_factor: 3,
                live: 4,
                dead: 0,
                expected_max_failure: 2,
                expected_error: None,
            },
            TestCase {
                replication_factor: 3,
                live: 3,
                dead: 1,
                expected_max_failure: 1,
                expected_error: None,
            },
            TestCase {
                replication_factor: 5,
                live: 2,
                dead: 2,
                expected_max_failure: 0,
                expected_error: Some("at least 3 live replicas required, could only find 2"),
            },
        ];

        let now = Time::from_timestamp(1000);
        for (i, tc) in cases.iter().enumerate() {
            let strategy = DefaultReplicationStrategy::new();
            let got = strategy.filter(
                candidates(now, tc.live, tc.dead),
                Operation::Read,
                tc.replication_factor,
                HEARTBEAT_TIMEOUT,
                false,
                now,
            );

            match tc.expected_error {
                None => {
                    let (instances, max_failure) = got.unwrap_or_else(|e| panic!("case {i}: {e}"));
                    assert_eq!(instances.len(), tc.live, "case {i}");
                    assert_eq!(max_failure, tc.expected_max_failure, "case {i}");
                }
                Some(want) => {
                    let err = got.expect_err("expected error");
                    assert_eq!(err.to_string(), want, "case {i}");
                }
            }
        }
    }

    #[test]
    fn test_default_replication_strategy_zone_aware_error() {
        let now = Time::from_timestamp(1000);
        let err = DefaultReplicationStrategy::new()
            .filter(
                candidates(now, 1, 2),
                Operation::Write,
                3,
                HEARTBEAT_TIMEOUT,
                true,
                now,
            )
            .expect_err("quorum must not be reachable");

        assert_eq!(
            err.to_string(),
            "at least 2 live replicas required across different availability zones, \
             could only find 1"
        );
    }

    #[test]
    fn test_ignore_unhealthy_instances_replication_strategy() {
        struct TestCase {
            name: &'static str,
            live: usize,
            dead: usize,
            expected_max_failure: usize,
            expected_error: Option<&'static str>,
        }

        let cases = [
            TestCase {
                name: "with at least 1 healthy instance",
                live: 1,
                dead: 0,
                expected_max_failure: 0,
                expected_error: None,
            },
            TestCase {
                name: "with more healthy instances than unhealthy",
                live: 2,
                dead: 1,
                expected_max_failure: 1,
                expected_error: None,
            },
            TestCase {
                name: "with equal number of healthy and unhealthy instances",
                live: 2,
                dead: 2,
                expected_max_failure: 1,
                expected_error: None,
            },
            TestCase {
                name: "with no healthy instances",
                live: 0,
                dead: 3,
                expected_max_failure: 0,
                expected_error: Some("at least 1 healthy replica required, could only find 0"),
            },
        ];

        let now = Time::from_timestamp(1000);
        for tc in &cases {
            let strategy = IgnoreUnhealthyInstancesReplicationStrategy::new();
            let got = strategy.filter(
                candidates(now, tc.live, tc.dead),
                Operation::Read,
                3,
                HEARTBEAT_TIMEOUT,
                false,
                now,
            );

            match tc.expected_error {
                None => {
                    let (instances, max_failure) =
                        got.unwrap_or_else(|e| panic!("{}: {e}", tc.name));
                    assert_eq!(instances.len(), tc.live, "{}", tc.name);
                    assert_eq!(max_failure, tc.expected_max_failure, "{}", tc.name);
                }
                Some(want) => {
                    let err = got.expect_err("expected error");
                    assert_eq!(err.to_string(), want, "{}", tc.name);
                }
            }
        }
    }
}
