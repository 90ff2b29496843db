//! Relay forward-outbox store (spec.md §3 "Relay forward outbox entry"):
//! commits applied locally by the relay's server role, waiting to be
//! forwarded upstream by the forward engine. Modeled on
//! [`client::InMemoryClientOutbox`]'s pending/sending/acked state machine,
//! with an extra `forwarded` terminal state since a relay entry also
//! records the upstream commit-seq it was assigned.

use std::collections::BTreeMap;

use chrono::{
    DateTime,
    Utc,
};
use commitlog::CommitSeq;
use handlers::Operation;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStatus {
    Pending,
    Forwarding,
    Forwarded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ForwardOutboxEntry {
    pub id: String,
    pub local_commit_seq: CommitSeq,
    pub client_id: String,
    pub client_commit_id: String,
    pub operations: Vec<Operation>,
    pub status: ForwardStatus,
    pub upstream_commit_seq: Option<CommitSeq>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Inner {
    entries: BTreeMap<String, ForwardOutboxEntry>,
    next_id: u64,
}

/// In-memory reference implementation; a SQL-backed adapter would give this
/// table a unique index on `local_commit_seq` so the atomic-enqueue-or-fail
/// behaviour spec.md §4.10's server role depends on (used by
/// [`crate::server::relay_push_commit`]) is enforceable without the caller
/// pre-checking.
pub struct InMemoryForwardOutbox {
    inner: Mutex<Inner>,
    reject_inserts: bool,
}

impl Default for InMemoryForwardOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryForwardOutbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_id: 1,
            }),
            reject_inserts: false,
        }
    }

    /// Test/fault-injection hook for spec.md's S7 scenario: a store that
    /// rejects every insert, exercising the server role's rollback path.
    pub fn new_rejecting() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_id: 1,
            }),
            reject_inserts: true,
        }
    }

    pub fn enqueue(
        &self,
        local_commit_seq: CommitSeq,
        client_id: &str,
        client_commit_id: &str,
        operations: Vec<Operation>,
    ) -> anyhow::Result<String> {
        if self.reject_inserts {
            anyhow::bail!("forward outbox insert rejected");
        }
        let mut inner = self.inner.lock();
        if inner
            .entries
            .values()
            .any(|e| e.local_commit_seq == local_commit_seq)
        {
            anyhow::bail!("duplicate forward-outbox insert for commit {local_commit_seq:?}");
        }
        let id = format!("fwd-{}", inner.next_id);
        inner.next_id += 1;
        let now = Utc::now();
        inner.entries.insert(
            id.clone(),
            ForwardOutboxEntry {
                id: id.clone(),
                local_commit_seq,
                client_id: client_id.to_string(),
                client_commit_id: client_commit_id.to_string(),
                operations,
                status: ForwardStatus::Pending,
                upstream_commit_seq: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    /// Claims the oldest `pending` entry, or a `forwarding` one whose last
    /// update is older than `stale_after` (spec.md §4.10's crash-recovery
    /// note on the forward engine).
    pub fn claim_next(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> Option<ForwardOutboxEntry> {
        let mut inner = self.inner.lock();
        let candidate_id = inner
            .entries
            .values()
            .filter(|e| {
                e.status == ForwardStatus::Pending
                    || (e.status == ForwardStatus::Forwarding && now - e.updated_at >= stale_after)
            })
            .min_by_key(|e| e.local_commit_seq)
            .map(|e| e.id.clone())?;
        let entry = inner.entries.get_mut(&candidate_id)?;
        entry.status = ForwardStatus::Forwarding;
        entry.updated_at = now;
        Some(entry.clone())
    }

    pub fn mark_forwarded(&self, id: &str, upstream_commit_seq: CommitSeq) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.status = ForwardStatus::Forwarded;
            entry.upstream_commit_seq = Some(upstream_commit_seq);
            entry.updated_at = Utc::now();
        }
    }

    pub fn mark_failed(&self, id: &str, error: impl Into<String>) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.status = ForwardStatus::Failed;
            entry.error = Some(error.into());
            entry.updated_at = Utc::now();
        }
    }

    pub fn mark_pending(&self, id: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.status = ForwardStatus::Pending;
            entry.updated_at = Utc::now();
        }
    }

    pub fn get(&self, id: &str) -> Option<ForwardOutboxEntry> {
        self.inner.lock().entries.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
