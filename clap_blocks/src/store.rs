//! Selection of the KV store backing the ring.

use std::time::Duration;

/// The available ring store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreType {
    /// An external Consul agent.
    Consul,
    /// The embedded gossip KV; no external coordinator needed.
    Memberlist,
    /// Process-local only; for tests and single-node deployments.
    Inmemory,
}

/// Which store the ring descriptor is replicated through, plus the options
/// of the Consul backend.
#[derive(Debug, Clone, clap::Parser)]
pub struct StoreConfig {
    /// The KV store backend.
    #[clap(
        long = "ring-store",
        env = "RING_STORE",
        value_enum,
        default_value = "memberlist"
    )]
    pub store: StoreType,

    /// Base URL of the Consul agent.
    #[clap(
        long = "consul-host",
        env = "CONSUL_HOST",
        default_value = "http://127.0.0.1:8500"
    )]
    pub consul_host: String,

    /// ACL token attached to every Consul request.
    #[clap(long = "consul-acl-token", env = "CONSUL_ACL_TOKEN")]
    pub consul_acl_token: Option<String>,

    /// How long Consul blocking (watch) queries park before returning
    /// unchanged.
    #[clap(
        long = "consul-watch-wait",
        env = "CONSUL_WATCH_WAIT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub consul_watch_wait: Duration,
}

impl StoreConfig {
    /// The Consul client config described by this block.
    pub fn consul_config(&self) -> kv::consul::ConsulConfig {
        kv::consul::ConsulConfig {
            host: self.consul_host.clone(),
            acl_token: self.consul_acl_token.clone(),
            watch_wait: self.consul_watch_wait,
            // Consul adds up to wait/16 jitter server-side; leave double
            // the wait for the response to make it back.
            http_timeout: self.consul_watch_wait * 2,
        }
    }
}
