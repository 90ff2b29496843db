//! Append-only commit log (spec.md §4.2, component C2).
//!
//! [`CommitLogStore`] is the trait the push and pull engines program
//! against; [`InMemoryCommitLog`] is the reference implementation used by
//! every test in this workspace and by the single-process server binary.
//! A production deployment backed by a SQL dialect adapter would implement
//! the same trait (dialect adapters are an explicit external collaborator
//! per spec.md §1) without changing any caller.

mod ids;
mod mem;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
pub use ids::{
    ChangeId,
    CommitSeq,
    PartitionId,
};
use scope::ScopeMap;
use serde::{
    Deserialize,
    Serialize,
};

pub use crate::mem::{
    CompactionReport,
    InMemoryCommitLog,
    PruneReport,
};

/// Opaque row payload. The engine never interprets this beyond passing it
/// through handlers and across the wire (design note in SPEC_FULL.md §3:
/// "Dynamic typing of row payloads").
pub type RowValue = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowOp {
    Upsert,
    Delete,
}

/// One row-level side effect of a commit, not yet assigned a `change_id`.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub table: String,
    pub row_id: String,
    pub op: RowOp,
    pub row: Option<RowValue>,
    pub row_version: Option<u64>,
    pub scopes: ScopeMap,
}

/// A persisted change row, spec.md §3 "Change row".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRow {
    pub change_id: ChangeId,
    pub commit_seq: CommitSeq,
    pub table: String,
    pub row_id: String,
    pub op: RowOp,
    pub row: Option<RowValue>,
    pub row_version: Option<u64>,
    pub scopes: ScopeMap,
}

/// A persisted commit, spec.md §3 "Commit".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub commit_seq: CommitSeq,
    pub partition: PartitionId,
    pub actor_id: String,
    pub client_id: String,
    pub client_commit_id: String,
    pub created_at: DateTime<Utc>,
    pub meta: Option<serde_json::Value>,
    pub result: serde_json::Value,
    pub change_count: usize,
    pub tables: Vec<String>,
}

/// Per-(partition, client) cursor bookkeeping, spec.md §3 "Client cursor".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCursor {
    pub partition: PartitionId,
    pub client_id: String,
    pub actor_id: String,
    pub last_acked_commit_seq: CommitSeq,
    pub effective_scopes: ScopeMap,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of [`CommitLogStore::append_commit`]: either a fresh commit or a
/// replay of a previously applied one (spec.md §4.2's idempotency rule,
/// property P1).
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Applied {
        commit_seq: CommitSeq,
        created_at: DateTime<Utc>,
    },
    Cached {
        commit_seq: CommitSeq,
        result: serde_json::Value,
    },
}

#[async_trait]
pub trait CommitLogStore: Send + Sync {
    /// Idempotent by `(partition, client_id, client_commit_id)`: a repeat
    /// call with the same triple returns the original outcome without
    /// allocating a new commit-seq or writing new change rows (property P1).
    /// `changes` and the table-commit index rows are written atomically
    /// with the commit row.
    async fn append_commit(
        &self,
        partition: &PartitionId,
        actor_id: &str,
        client_id: &str,
        client_commit_id: &str,
        meta: Option<serde_json::Value>,
        result: serde_json::Value,
        changes: Vec<NewChange>,
    ) -> anyhow::Result<AppendOutcome>;

    /// Ordered by `(commit_seq asc, change_id asc)` (property P3), filtered
    /// to changes whose scopes satisfy `requested_scopes`.
    async fn read_changes_for_commits(
        &self,
        partition: &PartitionId,
        table: &str,
        commit_seqs: &[CommitSeq],
        requested_scopes: &ScopeMap,
    ) -> anyhow::Result<Vec<ChangeRow>>;

    /// Up to `limit` commit-seqs strictly greater than `after`, for commits
    /// that touched `table` and still have a surviving parent commit row
    /// (cascade-safe against concurrent compaction), ascending.
    async fn scan_table_commits_after(
        &self,
        partition: &PartitionId,
        table: &str,
        after: CommitSeq,
        limit: usize,
    ) -> anyhow::Result<Vec<CommitSeq>>;

    async fn read_max_commit_seq(&self, partition: &PartitionId) -> anyhow::Result<CommitSeq>;

    async fn read_commit(
        &self,
        partition: &PartitionId,
        commit_seq: CommitSeq,
    ) -> anyhow::Result<Option<Commit>>;

    /// Read-only lookup of the idempotency index (property P1): the commit
    /// a prior call with this `(client_id, client_commit_id)` produced, if
    /// any, without writing anything. Callers that need to short-circuit
    /// before dispatching side effects (the push engine) check this ahead
    /// of `append_commit`, which would otherwise only report the replay
    /// after the caller has already re-run its side effects.
    async fn find_cached_commit(
        &self,
        partition: &PartitionId,
        client_id: &str,
        client_commit_id: &str,
    ) -> anyhow::Result<Option<Commit>>;

    /// Last-writer-wins keyed by `(partition, client_id)`.
    async fn record_client_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
        actor_id: &str,
        cursor: CommitSeq,
        effective_scopes: ScopeMap,
    ) -> anyhow::Result<()>;

    async fn read_client_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
    ) -> anyhow::Result<Option<ClientCursor>>;

    /// Deletes a commit, its change rows, its table-index entries, and its
    /// idempotency-key mapping. Used only by the relay's server role
    /// (spec.md §4.10) to undo a local commit whose paired forward-outbox
    /// insert failed, so the two stores cannot diverge. Not part of normal
    /// push/pull traffic.
    async fn rollback_commit(
        &self,
        partition: &PartitionId,
        commit_seq: CommitSeq,
    ) -> anyhow::Result<()>;
}

/// Per-(table, row-id) grouping key used by compaction (spec.md §4.11) to
/// decide which change rows are superseded.
pub type CompactionGroupKey = (PartitionId, String, String, String);

/// Snapshot of table -> surviving commit-seqs, handed to callers who need to
/// recompute the table-commit index after a maintenance pass.
pub type TableCommitCounts = BTreeMap<String, usize>;
