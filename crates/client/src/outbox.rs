use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{
    DateTime,
    Duration,
    Utc,
};
use commitlog::CommitSeq;
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sending,
    Acked,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: String,
    pub client_commit_id: String,
    pub operations: Vec<handlers::Operation>,
    pub schema_version: Option<i64>,
    pub status: OutboxStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub commit_seq: Option<CommitSeq>,
    pub response_json: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable client-side buffer giving at-least-once push delivery (spec.md
/// §4.7, component C7). Every method is atomic with respect to concurrent
/// callers, matching the single-flight `syncOnce` contract of §5.
#[async_trait]
pub trait ClientOutbox: Send + Sync {
    async fn enqueue(
        &self,
        operations: Vec<handlers::Operation>,
        schema_version: Option<i64>,
        client_commit_id: Option<String>,
    ) -> anyhow::Result<(String, String)>;

    /// Claims either the oldest `pending` entry, or a `sending` entry whose
    /// `updated_at` is older than `stale_timeout`, transitioning it to
    /// `sending` and incrementing its attempt count.
    async fn get_next_sendable(
        &self,
        stale_timeout: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<OutboxEntry>>;

    async fn mark_sending(&self, id: &str) -> anyhow::Result<()>;
    async fn mark_pending(&self, id: &str, error: Option<String>) -> anyhow::Result<()>;
    async fn mark_acked(
        &self,
        id: &str,
        commit_seq: CommitSeq,
        response_json: Option<Value>,
    ) -> anyhow::Result<()>;
    async fn mark_failed(
        &self,
        id: &str,
        error: String,
        response_json: Option<Value>,
    ) -> anyhow::Result<()>;

    async fn cleanup_acked(&self) -> anyhow::Result<usize>;
    async fn cleanup_failed(&self) -> anyhow::Result<usize>;
    async fn cleanup_all(&self) -> anyhow::Result<usize>;

    async fn pending_count(&self) -> anyhow::Result<usize>;
}

struct Inner {
    entries: BTreeMap<String, OutboxEntry>,
    next_id: u64,
}

/// Reference [`ClientOutbox`]: an in-process, `parking_lot`-guarded map.
/// A real client would back this with on-device SQLite; the state machine
/// here is what any such backing store must implement.
pub struct InMemoryClientOutbox {
    inner: Mutex<Inner>,
}

impl Default for InMemoryClientOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClientOutbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }
}

#[async_trait]
impl ClientOutbox for InMemoryClientOutbox {
    async fn enqueue(
        &self,
        operations: Vec<handlers::Operation>,
        schema_version: Option<i64>,
        client_commit_id: Option<String>,
    ) -> anyhow::Result<(String, String)> {
        let mut inner = self.inner.lock();
        let id = format!("outbox-{}", inner.next_id);
        inner.next_id += 1;
        let now = Utc::now();
        let client_commit_id = client_commit_id.unwrap_or_else(|| id.clone());
        inner.entries.insert(
            id.clone(),
            OutboxEntry {
                id: id.clone(),
                client_commit_id: client_commit_id.clone(),
                operations,
                schema_version,
                status: OutboxStatus::Pending,
                attempt_count: 0,
                last_error: None,
                commit_seq: None,
                response_json: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok((id, client_commit_id))
    }

    async fn get_next_sendable(
        &self,
        stale_timeout: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<OutboxEntry>> {
        let mut inner = self.inner.lock();
        let candidate_id = inner
            .entries
            .values()
            .filter(|e| {
                e.status == OutboxStatus::Pending
                    || (e.status == OutboxStatus::Sending && now - e.updated_at > stale_timeout)
            })
            .min_by_key(|e| e.created_at)
            .map(|e| e.id.clone());

        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let entry = inner.entries.get_mut(&id).unwrap();
        entry.status = OutboxStatus::Sending;
        entry.attempt_count += 1;
        entry.last_error = None;
        entry.updated_at = now;
        Ok(Some(entry.clone()))
    }

    async fn mark_sending(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.status = OutboxStatus::Sending;
        }
        Ok(())
    }

    async fn mark_pending(&self, id: &str, error: Option<String>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.status = OutboxStatus::Pending;
            entry.last_error = error;
        }
        Ok(())
    }

    async fn mark_acked(
        &self,
        id: &str,
        commit_seq: CommitSeq,
        response_json: Option<Value>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.status = OutboxStatus::Acked;
            entry.commit_seq = Some(commit_seq);
            entry.response_json = response_json;
            entry.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: String,
        response_json: Option<Value>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.status = OutboxStatus::Failed;
            entry.last_error = Some(error);
            entry.response_json = response_json;
        }
        Ok(())
    }

    async fn cleanup_acked(&self) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.status != OutboxStatus::Acked);
        Ok(before - inner.entries.len())
    }

    async fn cleanup_failed(&self) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.status != OutboxStatus::Failed);
        Ok(before - inner.entries.len())
    }

    async fn cleanup_all(&self) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        Ok(count)
    }

    async fn pending_count(&self) -> anyhow::Result<usize> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .values()
            .filter(|e| matches!(e.status, OutboxStatus::Pending | OutboxStatus::Sending))
            .count())
    }
}
