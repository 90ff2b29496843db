//! Relay sequence-map store (spec.md §3 "Relay sequence-map entry"): the
//! bidirectional index between a relay's local commit-seq namespace and its
//! upstream's, keyed by table since each table's forwarded/pulled commits
//! advance independently.

use std::collections::BTreeMap;

use chrono::{
    DateTime,
    Utc,
};
use commitlog::CommitSeq;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Pending,
    Forwarded,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct SequenceMapEntry {
    pub local_seq: CommitSeq,
    pub upstream_seq: Option<CommitSeq>,
    pub table: String,
    pub status: SequenceStatus,
    pub updated_at: DateTime<Utc>,
}

/// In-memory reference implementation, mirroring
/// [`commitlog::InMemoryCommitLog`]'s `Mutex`-guarded-map idiom.
#[derive(Default)]
pub struct InMemorySequenceMap {
    inner: Mutex<BTreeMap<CommitSeq, SequenceMapEntry>>,
}

impl InMemorySequenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pending(&self, local_seq: CommitSeq, table: &str) {
        let mut inner = self.inner.lock();
        inner.insert(
            local_seq,
            SequenceMapEntry {
                local_seq,
                upstream_seq: None,
                table: table.to_string(),
                status: SequenceStatus::Pending,
                updated_at: Utc::now(),
            },
        );
    }

    /// Inserts a `confirmed` entry directly, for commits the relay learned
    /// about by pulling from upstream rather than forwarding locally
    /// (spec.md §4.10 "Pull engine").
    pub fn insert_confirmed(&self, local_seq: CommitSeq, upstream_seq: CommitSeq, table: &str) {
        let mut inner = self.inner.lock();
        inner.insert(
            local_seq,
            SequenceMapEntry {
                local_seq,
                upstream_seq: Some(upstream_seq),
                table: table.to_string(),
                status: SequenceStatus::Confirmed,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn mark_forwarded(&self, local_seq: CommitSeq, upstream_seq: CommitSeq) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&local_seq) {
            entry.upstream_seq = Some(upstream_seq);
            entry.status = SequenceStatus::Forwarded;
            entry.updated_at = Utc::now();
        }
    }

    pub fn remove(&self, local_seq: CommitSeq) {
        self.inner.lock().remove(&local_seq);
    }

    pub fn get(&self, local_seq: CommitSeq) -> Option<SequenceMapEntry> {
        self.inner.lock().get(&local_seq).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops `forwarded`/`confirmed` entries older than `max_age`, the
    /// sequence-map half of spec.md §3's lifecycle note ("pending entries
    /// are retained until forwarded").
    pub fn prune_settled(&self, now: DateTime<Utc>, max_age: chrono::Duration) {
        let mut inner = self.inner.lock();
        inner.retain(|_, entry| {
            entry.status == SequenceStatus::Pending || now - entry.updated_at < max_age
        });
    }
}
