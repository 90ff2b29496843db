//! Maintenance sweep (spec.md §4.11, component C11): compaction, pruning,
//! and snapshot-chunk TTL cleanup, each driven by its own interval from the
//! configuration map (spec.md §6).

use std::time::Duration;

use chrono::{
    DateTime,
    Utc,
};
use commitlog::{
    CompactionReport,
    InMemoryCommitLog,
    PartitionId,
    PruneReport,
};
use snapshot::SnapshotChunkStore;

/// Subset of spec.md §6's configuration map this crate consumes. Only
/// `pruneMaxAgeMs` is named there; `keep_newest` and the fallback-vs-active
/// window split are this implementation's resolution of §4.11's otherwise
/// unspecified prune bound (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub full_history: Duration,
    pub prune_interval: Duration,
    pub prune_active_window: Duration,
    pub prune_fallback_max_age: Duration,
    pub prune_keep_newest: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            full_history: Duration::from_secs(24 * 3600),
            prune_interval: Duration::from_secs(3600),
            prune_active_window: Duration::from_millis(604_800_000),
            prune_fallback_max_age: Duration::from_millis(604_800_000 * 4),
            prune_keep_newest: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub compaction: Option<CompactionSummary>,
    pub prune: Option<PruneSummary>,
    pub chunks_expired: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionSummary {
    pub changes_deleted: usize,
    pub table_index_rows_deleted: usize,
}

impl From<CompactionReport> for CompactionSummary {
    fn from(r: CompactionReport) -> Self {
        Self {
            changes_deleted: r.changes_deleted,
            table_index_rows_deleted: r.table_index_rows_deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneSummary {
    pub commits_deleted: usize,
    pub used_fallback_cutoff: bool,
}

impl From<PruneReport> for PruneSummary {
    fn from(r: PruneReport) -> Self {
        Self {
            commits_deleted: r.commits_deleted,
            used_fallback_cutoff: r.used_fallback_cutoff,
        }
    }
}

/// One maintenance pass over a single partition: compact, then prune, then
/// sweep expired snapshot chunks. Callers drive this from a
/// `tokio::time::interval` at `config.prune_interval` (a `prune_interval`
/// of zero disables the pass entirely, per spec.md §6 "0 disables").
pub async fn run_maintenance(
    store: &InMemoryCommitLog,
    chunks: &dyn SnapshotChunkStore,
    partition: &PartitionId,
    config: &MaintenanceConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<MaintenanceReport> {
    if config.prune_interval.is_zero() {
        return Ok(MaintenanceReport::default());
    }

    let compaction_cutoff = now
        - chrono::Duration::from_std(config.full_history).unwrap_or_else(|_| chrono::Duration::zero());
    let compaction = store.compact(partition, compaction_cutoff);
    tracing::info!(
        changes_deleted = compaction.changes_deleted,
        table_index_rows_deleted = compaction.table_index_rows_deleted,
        "maintenance compaction pass"
    );

    let prune = store.prune(
        partition,
        config.prune_keep_newest,
        config.prune_active_window,
        config.prune_fallback_max_age,
        now,
    );
    tracing::info!(
        commits_deleted = prune.commits_deleted,
        used_fallback_cutoff = prune.used_fallback_cutoff,
        "maintenance prune pass"
    );

    let chunks_expired = chunks.cleanup_expired(now).await?;
    tracing::info!(chunks_expired, "maintenance chunk TTL sweep");

    Ok(MaintenanceReport {
        compaction: Some(compaction.into()),
        prune: Some(prune.into()),
        chunks_expired,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use commitlog::{
        CommitLogStore,
        RowOp,
    };
    use scope::ScopeMap;
    use snapshot::InMemorySnapshotChunkStore;

    use super::*;

    fn change(table: &str, row_id: &str) -> commitlog::NewChange {
        commitlog::NewChange {
            table: table.to_string(),
            row_id: row_id.to_string(),
            op: RowOp::Upsert,
            row: Some(serde_json::json!({"title": "hi"})),
            row_version: Some(1),
            scopes: ScopeMap::new(),
        }
    }

    #[tokio::test]
    async fn zero_interval_disables_the_pass() {
        let store = InMemoryCommitLog::new();
        let chunks = InMemorySnapshotChunkStore::new();
        let partition = PartitionId::default_partition();
        let mut config = MaintenanceConfig::default();
        config.prune_interval = StdDuration::ZERO;

        let report = run_maintenance(&store, &chunks, &partition, &config, Utc::now())
            .await
            .unwrap();
        assert!(report.compaction.is_none());
        assert_eq!(report.chunks_expired, 0);
    }

    #[tokio::test]
    async fn compacts_old_duplicate_changes_and_sweeps_expired_chunks() {
        let store = InMemoryCommitLog::new();
        let chunks = InMemorySnapshotChunkStore::new();
        let partition = PartitionId::default_partition();

        for _ in 0..3 {
            store
                .append_commit(
                    &partition,
                    "u1",
                    "c1",
                    &uuid_like(),
                    None,
                    serde_json::json!({}),
                    vec![change("tasks", "t1")],
                )
                .await
                .unwrap();
        }

        let key = snapshot::ChunkCacheKey {
            partition: partition.clone(),
            table: "tasks".to_string(),
            scope_key: "all".to_string(),
            scope: ScopeMap::new(),
            as_of_commit_seq: commitlog::CommitSeq(3),
            row_cursor: None,
            row_limit: 10,
            encoding: "json-row-frame-v1".to_string(),
            compression: "gzip".to_string(),
        };
        chunks
            .find_or_store_chunk(&key, &[serde_json::json!({"id": "t1"})], StdDuration::from_secs(0))
            .await
            .unwrap();

        let config = MaintenanceConfig {
            full_history: StdDuration::from_secs(0),
            ..MaintenanceConfig::default()
        };
        let report = run_maintenance(&store, &chunks, &partition, &config, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let compaction = report.compaction.unwrap();
        assert_eq!(compaction.changes_deleted, 2);
        assert_eq!(report.chunks_expired, 1);
    }

    fn uuid_like() -> String {
        use std::sync::atomic::{
            AtomicU64,
            Ordering,
        };
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("k{}", COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}
