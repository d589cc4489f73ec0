//! CLI configuration for the embedded gossip KV.

use std::time::Duration;

/// Gossip KV options, used when the ring store is `memberlist`.
#[derive(Debug, Clone, clap::Parser)]
pub struct MemberlistConfig {
    /// The `ip:port` the gossip UDP socket binds to.
    #[clap(
        long = "memberlist-bind-addr",
        env = "MEMBERLIST_BIND_ADDR",
        default_value = "0.0.0.0:7946"
    )]
    pub bind_addr: String,

    /// Seed peer addresses to join the cluster through.
    #[clap(
        long = "memberlist-join",
        env = "MEMBERLIST_JOIN",
        required = false,
        num_args = 0..,
        value_delimiter = ','
    )]
    pub join: Vec<String>,

    /// The interval between anti-entropy full-state pushes.
    #[clap(
        long = "memberlist-pullpush-interval",
        env = "MEMBERLIST_PULLPUSH_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub pullpush_interval: Duration,

    /// How long LEFT tombstones are retained before being purged.
    #[clap(
        long = "memberlist-tombstone-retention",
        env = "MEMBERLIST_TOMBSTONE_RETENTION",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub tombstone_retention: Duration,
}

impl From<&MemberlistConfig> for memberlist::MemberlistConfig {
    fn from(v: &MemberlistConfig) -> Self {
        Self {
            bind_addr: v.bind_addr.clone(),
            join: v.join.clone(),
            pullpush_interval: v.pullpush_interval,
            tombstone_retention: v.tombstone_retention,
        }
    }
}
