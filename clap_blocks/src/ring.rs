//! CLI configuration for the ring and its lifecycler.

use std::path::PathBuf;
use std::time::Duration;

/// Ring read-side options, shared by every service that queries placement.
#[derive(Debug, Clone, clap::Parser)]
pub struct RingConfig {
    /// The KV key the ring descriptor is stored under.
    #[clap(long = "ring-key", env = "RING_KEY", default_value = "ring")]
    pub key: String,

    /// How often an instance refreshes its heartbeat.
    #[clap(
        long = "ring-heartbeat-period",
        env = "RING_HEARTBEAT_PERIOD",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_period: Duration,

    /// How stale a heartbeat may be before the instance is unhealthy for
    /// ring operations.
    #[clap(
        long = "ring-heartbeat-timeout",
        env = "RING_HEARTBEAT_TIMEOUT",
        default_value = "1m",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_timeout: Duration,

    /// The number of replicas to select per key.
    #[clap(
        long = "ring-replication-factor",
        env = "RING_REPLICATION_FACTOR",
        default_value = "3"
    )]
    pub replication_factor: usize,

    /// Spread replicas of each key across distinct availability zones.
    #[clap(
        long = "ring-zone-awareness-enabled",
        env = "RING_ZONE_AWARENESS_ENABLED"
    )]
    pub zone_awareness_enabled: bool,

    /// Remove instances whose heartbeat is older than this many heartbeat
    /// timeouts (0 disables auto-forget).
    #[clap(
        long = "ring-auto-forget-periods",
        env = "RING_AUTO_FORGET_PERIODS",
        default_value = "10"
    )]
    pub auto_forget_periods: u32,

    /// Whether LEAVING instances are eligible for reporting queries.
    #[clap(
        long = "ring-reporting-includes-leaving",
        env = "RING_REPORTING_INCLUDES_LEAVING",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub reporting_includes_leaving: bool,
}

impl From<&RingConfig> for ring::RingConfig {
    fn from(v: &RingConfig) -> Self {
        Self {
            key: v.key.clone(),
            heartbeat_timeout: v.heartbeat_timeout,
            replication_factor: v.replication_factor,
            zone_awareness_enabled: v.zone_awareness_enabled,
            reporting_includes_leaving: v.reporting_includes_leaving,
        }
    }
}

/// Lifecycler options for services that register into the ring.
#[derive(Debug, Clone, clap::Parser)]
pub struct LifecyclerConfig {
    /// This instance's id; must be stable across restarts of one instance.
    #[clap(long = "lifecycler-id", env = "LIFECYCLER_ID")]
    pub id: String,

    /// The address advertised to other ring members.
    #[clap(long = "lifecycler-addr", env = "LIFECYCLER_ADDR")]
    pub addr: String,

    /// The availability zone advertised to the ring.
    #[clap(long = "lifecycler-zone", env = "LIFECYCLER_ZONE", default_value = "")]
    pub zone: String,

    /// Tokens to claim on the ring.
    #[clap(
        long = "lifecycler-num-tokens",
        env = "LIFECYCLER_NUM_TOKENS",
        default_value = "128"
    )]
    pub num_tokens: usize,

    /// Delay between process start and joining the ring.
    #[clap(
        long = "lifecycler-join-after",
        env = "LIFECYCLER_JOIN_AFTER",
        default_value = "0s",
        value_parser = humantime::parse_duration
    )]
    pub join_after: Duration,

    /// Minimum ACTIVE dwell before the instance reports ready.
    #[clap(
        long = "lifecycler-min-ready-duration",
        env = "LIFECYCLER_MIN_READY_DURATION",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub min_ready_duration: Duration,

    /// How long to watch for token conflicts before activating.
    #[clap(
        long = "lifecycler-observe-period",
        env = "LIFECYCLER_OBSERVE_PERIOD",
        default_value = "0s",
        value_parser = humantime::parse_duration
    )]
    pub observe_period: Duration,

    /// Sleep between the leave hooks finishing and the ring entry being
    /// removed.
    #[clap(
        long = "lifecycler-final-sleep",
        env = "LIFECYCLER_FINAL_SLEEP",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub final_sleep: Duration,

    /// Handoff attempts against a LEAVING donor (0 disables handoff).
    #[clap(
        long = "lifecycler-max-transfer-retries",
        env = "LIFECYCLER_MAX_TRANSFER_RETRIES",
        default_value = "0"
    )]
    pub max_transfer_retries: usize,

    /// Persist tokens here so restarts keep stable placement.
    #[clap(long = "lifecycler-tokens-file-path", env = "LIFECYCLER_TOKENS_FILE_PATH")]
    pub tokens_file_path: Option<PathBuf>,
}

impl LifecyclerConfig {
    /// Combine this block with the shared ring options into the library
    /// config.
    pub fn as_config(&self, ring: &RingConfig) -> ring::LifecyclerConfig {
        let mut cfg = ring::LifecyclerConfig::new(self.id.clone(), self.addr.clone());
        cfg.ring = ring.into();
        cfg.zone = self.zone.clone();
        cfg.num_tokens = self.num_tokens;
        cfg.heartbeat_period = ring.heartbeat_period;
        cfg.join_after = self.join_after;
        cfg.min_ready_duration = self.min_ready_duration;
        cfg.observe_period = self.observe_period;
        cfg.final_sleep = self.final_sleep;
        cfg.max_transfer_retries = self.max_transfer_retries;
        cfg.tokens_file_path = self.tokens_file_path.clone();
        cfg.auto_forget_periods = ring.auto_forget_periods;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, clap::Parser)]
    struct TestApp {
        #[clap(flatten)]
        ring: RingConfig,

        #[clap(flatten)]
        lifecycler: LifecyclerConfig,
    }

    #[test]
    fn test_defaults() {
        let app = TestApp::try_parse_from([
            "my_binary",
            "--lifecycler-id",
            "instance-1",
            "--lifecycler-addr",
            "10.0.0.1:9000",
        ])
        .unwrap();

        assert_eq!(app.ring.key, "ring");
        assert_eq!(app.ring.heartbeat_period, Duration::from_secs(5));
        assert_eq!(app.ring.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(app.ring.replication_factor, 3);
        assert!(!app.ring.zone_awareness_enabled);
        assert_eq!(app.ring.auto_forget_periods, 10);
        assert!(app.ring.reporting_includes_leaving);

        let cfg = app.lifecycler.as_config(&app.ring);
        assert_eq!(cfg.id, "instance-1");
        assert_eq!(cfg.num_tokens, 128);
        assert_eq!(cfg.heartbeat_period, Duration::from_secs(5));
        assert_eq!(cfg.auto_forget_periods, 10);
        assert_eq!(cfg.min_ready_duration, Duration::from_secs(15));
    }

    #[test]
    fn test_id_is_required() {
        let got = TestApp::try_parse_from(["my_binary", "--lifecycler-addr", "10.0.0.1:9000"]);
        assert_eq!(
            got.unwrap_err().kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_duration_parsing() {
        let app = TestApp::try_parse_from([
            "my_binary",
            "--lifecycler-id",
            "instance-1",
            "--lifecycler-addr",
            "10.0.0.1:9000",
            "--ring-heartbeat-timeout",
            "2m30s",
            "--lifecycler-observe-period",
            "10s",
            "--ring-reporting-includes-leaving",
            "false",
        ])
        .unwrap();

        assert_eq!(app.ring.heartbeat_timeout, Duration::from_secs(150));
        assert_eq!(app.lifecycler.observe_period, Duration::from_secs(10));
        assert!(!app.ring.reporting_includes_leaving);
    }
}
