//! Content-addressed, gzip-compressed bootstrap snapshot chunks (spec.md
//! §4.3, component C3).
//!
//! A chunk's cache key is `(partition, scope_key, scope, as_of_commit_seq,
//! row_cursor, row_limit, encoding, compression)`; its identity is the
//! SHA-256 of its *compressed* body, so two identical pages always resolve
//! to the same chunk (property P10) and a duplicate store is a no-op.

mod frames;
mod mem;

use chrono::{
    DateTime,
    Utc,
};
use commitlog::{
    CommitSeq,
    PartitionId,
};
use scope::ScopeMap;
use serde::{
    Deserialize,
    Serialize,
};

pub use crate::{
    frames::{
        decode_row_frames,
        encode_row_frames,
    },
    mem::InMemorySnapshotChunkStore,
};

/// Cache key for a single bootstrap page, spec.md §3 "Snapshot chunk".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCacheKey {
    pub partition: PartitionId,
    pub table: String,
    pub scope_key: String,
    pub scope: ScopeMap,
    pub as_of_commit_seq: CommitSeq,
    pub row_cursor: Option<String>,
    pub row_limit: usize,
    pub encoding: String,
    pub compression: String,
}

impl ChunkCacheKey {
    /// Deterministic string serialization used to look up an existing
    /// chunk before encoding a fresh one.
    pub fn canonical(&self) -> String {
        format!(
            "{}/{}/{}/scope={}/asof={}/cursor={}/limit={}/{}+{}",
            self.partition,
            self.table,
            self.scope_key,
            scope::scope_key(&self.scope),
            self.as_of_commit_seq,
            self.row_cursor.as_deref().unwrap_or(""),
            self.row_limit,
            self.encoding,
            self.compression,
        )
    }
}

/// A stored chunk's metadata plus (for the in-memory reference store) its
/// inline compressed body. Readers fall back to the inline body when an
/// external blob adapter lookup by `sha256` fails, per spec.md §4.3.
#[derive(Debug, Clone)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub sha256: String,
    pub byte_length: usize,
    pub blob_hash: Option<String>,
    pub encoding: String,
    pub compression: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChunkBody {
    pub chunk_ref: ChunkRef,
    pub compressed_bytes: Vec<u8>,
}

#[async_trait::async_trait]
pub trait SnapshotChunkStore: Send + Sync {
    /// Encodes `rows` into a single gzip member of length-prefixed JSON row
    /// frames (`json-row-frame-v1`), stores it under `key`'s canonical form,
    /// and returns its ref. A second call with an identical key and
    /// identical rows returns the existing chunk unchanged (insert-or-ignore
    /// on the cache key, property P10).
    async fn find_or_store_chunk(
        &self,
        key: &ChunkCacheKey,
        rows: &[serde_json::Value],
        ttl: std::time::Duration,
    ) -> anyhow::Result<ChunkRef>;

    async fn read_chunk(&self, chunk_id: &str) -> anyhow::Result<Option<ChunkBody>>;

    /// Deletes chunks whose `expires_at < now`; returns the count removed.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize>;
}
