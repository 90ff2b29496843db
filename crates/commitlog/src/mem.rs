use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;
use scope::{
    scope_key,
    matches as scope_matches,
    ScopeMap,
};

use crate::{
    AppendOutcome,
    ChangeId,
    ChangeRow,
    Commit,
    ClientCursor,
    CommitLogStore,
    CommitSeq,
    NewChange,
    PartitionId,
};

#[derive(Default)]
struct PartitionState {
    next_commit_seq: i64,
    next_change_id: i64,
    commits: BTreeMap<CommitSeq, Commit>,
    changes: BTreeMap<CommitSeq, Vec<ChangeRow>>,
    table_index: BTreeMap<String, BTreeSet<CommitSeq>>,
    idempotency: BTreeMap<(String, String), CommitSeq>,
    cursors: BTreeMap<String, ClientCursor>,
}

#[derive(Default)]
struct Inner {
    partitions: BTreeMap<PartitionId, PartitionState>,
}

/// Reference [`CommitLogStore`] implementation: a `parking_lot`-guarded
/// in-process log, matching the teacher's `database` crate style of
/// wrapping shared mutable state in `parking_lot::Mutex` (see
/// `crates/database/src/write_log.rs`). Used by every test in this
/// workspace and by the single-process server binary; a dialect-backed
/// store is an out-of-scope external collaborator (spec.md §1).
#[derive(Default)]
pub struct InMemoryCommitLog {
    inner: Mutex<Inner>,
}

pub struct CompactionReport {
    pub changes_deleted: usize,
    pub table_index_rows_deleted: usize,
}

pub struct PruneReport {
    pub commits_deleted: usize,
    pub used_fallback_cutoff: bool,
}

impl InMemoryCommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compact change rows older than `cutoff`, keeping only the
    /// highest-`commit_seq` (tie-break highest `change_id`) change per
    /// `(partition, table, row_id, canonical_scope)` group (spec.md §4.11,
    /// property P9).
    pub fn compact(&self, partition: &PartitionId, cutoff: DateTime<Utc>) -> CompactionReport {
        let mut inner = self.inner.lock();
        let Some(state) = inner.partitions.get_mut(partition) else {
            return CompactionReport {
                changes_deleted: 0,
                table_index_rows_deleted: 0,
            };
        };

        let old_commit_seqs: Vec<CommitSeq> = state
            .commits
            .iter()
            .filter(|(_, c)| c.created_at < cutoff)
            .map(|(seq, _)| *seq)
            .collect();

        // group_key -> (commit_seq, change_id, commit_seq-index-into-changes)
        let mut best: BTreeMap<(String, String, String), (CommitSeq, ChangeId)> = BTreeMap::new();
        for seq in &old_commit_seqs {
            let Some(rows) = state.changes.get(seq) else {
                continue;
            };
            for row in rows {
                let key = (row.table.clone(), row.row_id.clone(), scope_key(&row.scopes));
                let candidate = (row.commit_seq, row.change_id);
                best.entry(key)
                    .and_modify(|cur| {
                        if candidate > *cur {
                            *cur = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }

        let mut changes_deleted = 0usize;
        for seq in &old_commit_seqs {
            let Some(rows) = state.changes.get_mut(seq) else {
                continue;
            };
            let before = rows.len();
            rows.retain(|row| {
                let key = (row.table.clone(), row.row_id.clone(), scope_key(&row.scopes));
                best.get(&key) == Some(&(row.commit_seq, row.change_id))
            });
            changes_deleted += before - rows.len();
        }

        // Drop table-index rows for tables that no longer have any surviving
        // change among the compacted commits (but keep entries still backed
        // by un-compacted, newer commits).
        let mut table_index_rows_deleted = 0usize;
        let tables: Vec<String> = state.table_index.keys().cloned().collect();
        for table in tables {
            let surviving: BTreeSet<CommitSeq> = state
                .table_index
                .get(&table)
                .unwrap()
                .iter()
                .filter(|seq| {
                    state
                        .changes
                        .get(seq)
                        .map(|rows| rows.iter().any(|r| &r.table == &table))
                        .unwrap_or(false)
                        || !old_commit_seqs.contains(seq)
                })
                .copied()
                .collect();
            let removed = state.table_index.get(&table).unwrap().len() - surviving.len();
            table_index_rows_deleted += removed;
            if surviving.is_empty() {
                state.table_index.remove(&table);
            } else {
                state.table_index.insert(table, surviving);
            }
        }

        CompactionReport {
            changes_deleted,
            table_index_rows_deleted,
        }
    }

    /// Delete commits older than an active window, bounded by a
    /// keep-newest count, falling back to a more lenient max-age cutoff if
    /// the watermark would delete more than half the partition's commits
    /// (spec.md §4.11 "Prune"; the 50% guard is this implementation's
    /// resolution of that section's otherwise-unspecified shrink bound,
    /// recorded in DESIGN.md).
    pub fn prune(
        &self,
        partition: &PartitionId,
        keep_newest: usize,
        active_window: Duration,
        fallback_max_age: Duration,
        now: DateTime<Utc>,
    ) -> PruneReport {
        let mut inner = self.inner.lock();
        let Some(state) = inner.partitions.get_mut(partition) else {
            return PruneReport {
                commits_deleted: 0,
                used_fallback_cutoff: false,
            };
        };

        let all_seqs: Vec<CommitSeq> = state.commits.keys().copied().collect();
        let newest: BTreeSet<CommitSeq> = all_seqs
            .iter()
            .rev()
            .take(keep_newest)
            .copied()
            .collect();

        let active_cutoff = now - chrono::Duration::from_std(active_window).unwrap_or_default();
        let mut candidates: Vec<CommitSeq> = state
            .commits
            .iter()
            .filter(|(seq, c)| !newest.contains(seq) && c.created_at < active_cutoff)
            .map(|(seq, _)| *seq)
            .collect();

        let mut used_fallback_cutoff = false;
        if !all_seqs.is_empty() && candidates.len() * 2 > all_seqs.len() {
            used_fallback_cutoff = true;
            let fallback_cutoff =
                now - chrono::Duration::from_std(fallback_max_age).unwrap_or_default();
            candidates = state
                .commits
                .iter()
                .filter(|(seq, c)| !newest.contains(seq) && c.created_at < fallback_cutoff)
                .map(|(seq, _)| *seq)
                .collect();
        }

        for seq in &candidates {
            state.commits.remove(seq);
            state.changes.remove(seq);
            for set in state.table_index.values_mut() {
                set.remove(seq);
            }
        }
        state.table_index.retain(|_, set| !set.is_empty());

        PruneReport {
            commits_deleted: candidates.len(),
            used_fallback_cutoff,
        }
    }
}

#[async_trait]
impl CommitLogStore for InMemoryCommitLog {
    async fn append_commit(
        &self,
        partition: &PartitionId,
        actor_id: &str,
        client_id: &str,
        client_commit_id: &str,
        meta: Option<serde_json::Value>,
        result: serde_json::Value,
        changes: Vec<NewChange>,
    ) -> anyhow::Result<AppendOutcome> {
        let mut inner = self.inner.lock();
        let state = inner.partitions.entry(partition.clone()).or_default();

        let idem_key = (client_id.to_string(), client_commit_id.to_string());
        if let Some(existing_seq) = state.idempotency.get(&idem_key) {
            let existing = state
                .commits
                .get(existing_seq)
                .expect("idempotency index points at a missing commit");
            return Ok(AppendOutcome::Cached {
                commit_seq: *existing_seq,
                result: existing.result.clone(),
            });
        }

        state.next_commit_seq += 1;
        let commit_seq = CommitSeq(state.next_commit_seq);
        let created_at = Utc::now();

        let mut rows = Vec::with_capacity(changes.len());
        let mut tables = BTreeSet::new();
        for change in changes {
            state.next_change_id += 1;
            let change_id = ChangeId(state.next_change_id);
            tables.insert(change.table.clone());
            rows.push(ChangeRow {
                change_id,
                commit_seq,
                table: change.table,
                row_id: change.row_id,
                op: change.op,
                row: change.row,
                row_version: change.row_version,
                scopes: change.scopes,
            });
        }
        let tables: Vec<String> = tables.into_iter().collect();

        for table in &tables {
            state
                .table_index
                .entry(table.clone())
                .or_default()
                .insert(commit_seq);
        }

        let commit = Commit {
            commit_seq,
            partition: partition.clone(),
            actor_id: actor_id.to_string(),
            client_id: client_id.to_string(),
            client_commit_id: client_commit_id.to_string(),
            created_at,
            meta,
            result,
            change_count: rows.len(),
            tables,
        };
        state.commits.insert(commit_seq, commit);
        state.changes.insert(commit_seq, rows);
        state.idempotency.insert(idem_key, commit_seq);

        Ok(AppendOutcome::Applied {
            commit_seq,
            created_at,
        })
    }

    async fn read_changes_for_commits(
        &self,
        partition: &PartitionId,
        table: &str,
        commit_seqs: &[CommitSeq],
        requested_scopes: &ScopeMap,
    ) -> anyhow::Result<Vec<ChangeRow>> {
        let inner = self.inner.lock();
        let Some(state) = inner.partitions.get(partition) else {
            return Ok(vec![]);
        };
        let mut sorted_seqs = commit_seqs.to_vec();
        sorted_seqs.sort();

        let mut out = Vec::new();
        for seq in sorted_seqs {
            let Some(rows) = state.changes.get(&seq) else {
                continue;
            };
            for row in rows {
                if row.table != table {
                    continue;
                }
                if !scope_matches(&row.scopes, requested_scopes) {
                    continue;
                }
                out.push(row.clone());
            }
        }
        out.sort_by_key(|r| (r.commit_seq, r.change_id));
        Ok(out)
    }

    async fn scan_table_commits_after(
        &self,
        partition: &PartitionId,
        table: &str,
        after: CommitSeq,
        limit: usize,
    ) -> anyhow::Result<Vec<CommitSeq>> {
        let inner = self.inner.lock();
        let Some(state) = inner.partitions.get(partition) else {
            return Ok(vec![]);
        };
        let Some(set) = state.table_index.get(table) else {
            return Ok(vec![]);
        };
        Ok(set
            .iter()
            .filter(|seq| **seq > after && state.commits.contains_key(seq))
            .take(limit)
            .copied()
            .collect())
    }

    async fn read_max_commit_seq(&self, partition: &PartitionId) -> anyhow::Result<CommitSeq> {
        let inner = self.inner.lock();
        Ok(inner
            .partitions
            .get(partition)
            .map(|s| CommitSeq(s.next_commit_seq))
            .unwrap_or(CommitSeq::NONE))
    }

    async fn read_commit(
        &self,
        partition: &PartitionId,
        commit_seq: CommitSeq,
    ) -> anyhow::Result<Option<Commit>> {
        let inner = self.inner.lock();
        Ok(inner
            .partitions
            .get(partition)
            .and_then(|s| s.commits.get(&commit_seq))
            .cloned())
    }

    async fn find_cached_commit(
        &self,
        partition: &PartitionId,
        client_id: &str,
        client_commit_id: &str,
    ) -> anyhow::Result<Option<Commit>> {
        let inner = self.inner.lock();
        let Some(state) = inner.partitions.get(partition) else {
            return Ok(None);
        };
        let idem_key = (client_id.to_string(), client_commit_id.to_string());
        let Some(existing_seq) = state.idempotency.get(&idem_key) else {
            return Ok(None);
        };
        Ok(state.commits.get(existing_seq).cloned())
    }

    async fn record_client_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
        actor_id: &str,
        cursor: CommitSeq,
        effective_scopes: ScopeMap,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.partitions.entry(partition.clone()).or_default();
        state.cursors.insert(
            client_id.to_string(),
            ClientCursor {
                partition: partition.clone(),
                client_id: client_id.to_string(),
                actor_id: actor_id.to_string(),
                last_acked_commit_seq: cursor,
                effective_scopes,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn read_client_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
    ) -> anyhow::Result<Option<ClientCursor>> {
        let inner = self.inner.lock();
        Ok(inner
            .partitions
            .get(partition)
            .and_then(|s| s.cursors.get(client_id))
            .cloned())
    }

    async fn rollback_commit(&self, partition: &PartitionId, commit_seq: CommitSeq) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.partitions.get_mut(partition) else {
            return Ok(());
        };
        let Some(commit) = state.commits.remove(&commit_seq) else {
            return Ok(());
        };
        state.changes.remove(&commit_seq);
        for table in &commit.tables {
            if let Some(seqs) = state.table_index.get_mut(table) {
                seqs.remove(&commit_seq);
            }
        }
        state
            .idempotency
            .retain(|_, seq| *seq != commit_seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use scope::ScopeValue;

    use super::*;

    fn change(table: &str, row_id: &str, scopes: ScopeMap) -> NewChange {
        NewChange {
            table: table.to_string(),
            row_id: row_id.to_string(),
            op: crate::RowOp::Upsert,
            row: Some(serde_json::json!({"title": "hi"})),
            row_version: Some(1),
            scopes,
        }
    }

    #[tokio::test]
    async fn append_is_idempotent_by_client_commit_id() {
        let store = InMemoryCommitLog::new();
        let partition = PartitionId::default_partition();
        let scopes = ScopeMap::from([("user_id".to_string(), ScopeValue::single("u1"))]);

        let first = store
            .append_commit(
                &partition,
                "u1",
                "c1",
                "k1",
                None,
                serde_json::json!({"status": "applied"}),
                vec![change("tasks", "t1", scopes.clone())],
            )
            .await
            .unwrap();
        let AppendOutcome::Applied { commit_seq, .. } = first else {
            panic!("expected Applied");
        };
        assert_eq!(commit_seq, CommitSeq(1));

        let second = store
            .append_commit(
                &partition,
                "u1",
                "c1",
                "k1",
                None,
                serde_json::json!({"status": "applied"}),
                vec![change("tasks", "t1", scopes)],
            )
            .await
            .unwrap();
        match second {
            AppendOutcome::Cached { commit_seq, .. } => assert_eq!(commit_seq, CommitSeq(1)),
            AppendOutcome::Applied { .. } => panic!("expected Cached on replay"),
        }

        assert_eq!(
            store.read_max_commit_seq(&partition).await.unwrap(),
            CommitSeq(1)
        );
    }

    #[tokio::test]
    async fn scan_table_commits_after_is_ascending_and_exclusive() {
        let store = InMemoryCommitLog::new();
        let partition = PartitionId::default_partition();
        let scopes = ScopeMap::from([("user_id".to_string(), ScopeValue::single("u1"))]);
        for i in 0..4 {
            store
                .append_commit(
                    &partition,
                    "u1",
                    "c1",
                    &format!("k{i}"),
                    None,
                    serde_json::json!({}),
                    vec![change("tasks", "t1", scopes.clone())],
                )
                .await
                .unwrap();
        }
        let seqs = store
            .scan_table_commits_after(&partition, "tasks", CommitSeq(1), 2)
            .await
            .unwrap();
        assert_eq!(seqs, vec![CommitSeq(2), CommitSeq(3)]);
    }

    #[tokio::test]
    async fn compaction_keeps_latest_per_group() {
        let store = InMemoryCommitLog::new();
        let partition = PartitionId::default_partition();
        let scopes = ScopeMap::from([("user_id".to_string(), ScopeValue::single("u1"))]);
        for i in 0..3 {
            store
                .append_commit(
                    &partition,
                    "u1",
                    "c1",
                    &format!("k{i}"),
                    None,
                    serde_json::json!({}),
                    vec![change("tasks", "t1", scopes.clone())],
                )
                .await
                .unwrap();
        }
        let report = store.compact(&partition, Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(report.changes_deleted, 2);
        let remaining = store
            .read_changes_for_commits(
                &partition,
                "tasks",
                &[CommitSeq(1), CommitSeq(2), CommitSeq(3)],
                &scopes,
            )
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].commit_seq, CommitSeq(3));
    }

    #[tokio::test]
    async fn rollback_deletes_commit_changes_and_table_index() {
        let store = InMemoryCommitLog::new();
        let partition = PartitionId::default_partition();
        let scopes = ScopeMap::from([("user_id".to_string(), ScopeValue::single("u1"))]);
        let outcome = store
            .append_commit(
                &partition,
                "u1",
                "c1",
                "k1",
                None,
                serde_json::json!({}),
                vec![change("tasks", "t1", scopes.clone())],
            )
            .await
            .unwrap();
        let AppendOutcome::Applied { commit_seq, .. } = outcome else {
            panic!("expected a fresh commit");
        };

        store.rollback_commit(&partition, commit_seq).await.unwrap();

        assert!(store.read_commit(&partition, commit_seq).await.unwrap().is_none());
        let changes = store
            .read_changes_for_commits(&partition, "tasks", &[commit_seq], &scopes)
            .await
            .unwrap();
        assert!(changes.is_empty());
        let scanned = store
            .scan_table_commits_after(&partition, "tasks", CommitSeq(0), 10)
            .await
            .unwrap();
        assert!(scanned.is_empty());

        let replay = store
            .append_commit(
                &partition,
                "u1",
                "c1",
                "k1",
                None,
                serde_json::json!({}),
                vec![change("tasks", "t1", scopes.clone())],
            )
            .await
            .unwrap();
        assert!(matches!(replay, AppendOutcome::Applied { .. }));
    }
}
