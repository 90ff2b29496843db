//! Configuration map, spec.md §6 "CLI / env": every interval and limit the
//! sync engine's engines and maintenance loop consume, with the spec's
//! defaults. Authentication and deployment topology are external
//! collaborators (spec.md §1) and are not modeled here.

use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "sync-server", about = "Bidirectional commit-log sync server")]
pub struct SyncConfig {
    #[arg(long, env = "SYNC_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    #[arg(long, env = "SYNC_MAX_OPERATIONS_PER_PUSH", default_value_t = 200)]
    pub max_operations_per_push: usize,

    #[arg(long, env = "SYNC_MAX_SUBSCRIPTIONS_PER_PULL", default_value_t = 200)]
    pub max_subscriptions_per_pull: usize,

    #[arg(long, env = "SYNC_MAX_PULL_LIMIT_COMMITS", default_value_t = 100)]
    pub max_pull_limit_commits: usize,

    #[arg(long, env = "SYNC_STALE_TIMEOUT_MS", default_value_t = 30_000)]
    pub stale_timeout_ms: u64,

    #[arg(long, env = "SYNC_HEARTBEAT_INTERVAL_MS", default_value_t = 30_000)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, env = "SYNC_FORWARD_RETRY_INTERVAL_MS", default_value_t = 5_000)]
    pub forward_retry_interval_ms: u64,

    #[arg(long, env = "SYNC_PULL_INTERVAL_MS", default_value_t = 10_000)]
    pub pull_interval_ms: u64,

    #[arg(long, env = "SYNC_HEALTH_CHECK_INTERVAL_MS", default_value_t = 30_000)]
    pub health_check_interval_ms: u64,

    /// 0 disables the maintenance pass entirely.
    #[arg(long, env = "SYNC_PRUNE_INTERVAL_MS", default_value_t = 3_600_000)]
    pub prune_interval_ms: u64,

    #[arg(long, env = "SYNC_PRUNE_MAX_AGE_MS", default_value_t = 604_800_000)]
    pub prune_max_age_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_operations_per_push: 200,
            max_subscriptions_per_pull: 200,
            max_pull_limit_commits: 100,
            stale_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            forward_retry_interval_ms: 5_000,
            pull_interval_ms: 10_000,
            health_check_interval_ms: 30_000,
            prune_interval_ms: 3_600_000,
            prune_max_age_ms: 604_800_000,
        }
    }
}

impl SyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn maintenance_config(&self) -> maintenance::MaintenanceConfig {
        maintenance::MaintenanceConfig {
            prune_interval: self.prune_interval(),
            prune_active_window: Duration::from_millis(self.prune_max_age_ms),
            ..maintenance::MaintenanceConfig::default()
        }
    }
}
