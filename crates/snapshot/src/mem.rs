use std::collections::HashMap;

use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;
use sha2::{
    Digest,
    Sha256,
};

use crate::{
    frames::encode_row_frames,
    ChunkBody,
    ChunkCacheKey,
    ChunkRef,
    SnapshotChunkStore,
};

#[derive(Default)]
struct Inner {
    by_cache_key: HashMap<String, String>, // canonical key -> chunk_id
    chunks: HashMap<String, (ChunkRef, Vec<u8>)>,
}

/// Reference [`SnapshotChunkStore`]: everything lives in a
/// `parking_lot::Mutex`-guarded map, matching the in-process store idiom
/// used throughout this workspace (see `commitlog::InMemoryCommitLog`). An
/// external blob adapter is an out-of-scope collaborator (spec.md §1); this
/// store always serves the inline body.
#[derive(Default)]
pub struct InMemorySnapshotChunkStore {
    inner: Mutex<Inner>,
}

impl InMemorySnapshotChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SnapshotChunkStore for InMemorySnapshotChunkStore {
    async fn find_or_store_chunk(
        &self,
        key: &ChunkCacheKey,
        rows: &[serde_json::Value],
        ttl: std::time::Duration,
    ) -> anyhow::Result<ChunkRef> {
        let canonical = key.canonical();
        let mut inner = self.inner.lock();
        if let Some(existing_id) = inner.by_cache_key.get(&canonical) {
            return Ok(inner.chunks.get(existing_id).unwrap().0.clone());
        }

        let compressed = encode_row_frames(rows)?;
        let sha256 = hex::encode(Sha256::digest(&compressed));
        let now = Utc::now();
        let chunk_ref = ChunkRef {
            chunk_id: sha256.clone(),
            sha256: sha256.clone(),
            byte_length: compressed.len(),
            blob_hash: None,
            encoding: key.encoding.clone(),
            compression: key.compression.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        };

        // Two distinct cache keys can coincide in content (e.g. identical
        // empty pages); the chunk_id is content-addressed so we dedupe the
        // body store by sha256 but always record this cache key's mapping.
        inner
            .chunks
            .entry(sha256.clone())
            .or_insert_with(|| (chunk_ref.clone(), compressed));
        inner.by_cache_key.insert(canonical, sha256);

        Ok(chunk_ref)
    }

    async fn read_chunk(&self, chunk_id: &str) -> anyhow::Result<Option<ChunkBody>> {
        let inner = self.inner.lock();
        Ok(inner
            .chunks
            .get(chunk_id)
            .map(|(chunk_ref, bytes)| ChunkBody {
                chunk_ref: chunk_ref.clone(),
                compressed_bytes: bytes.clone(),
            }))
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .chunks
            .iter()
            .filter(|(_, (chunk_ref, _))| chunk_ref.expires_at < now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.chunks.remove(id);
        }
        inner.by_cache_key.retain(|_, id| !expired.contains(id));
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use commitlog::{
        CommitSeq,
        PartitionId,
    };
    use scope::ScopeMap;

    use super::*;
    use crate::decode_row_frames;

    fn key() -> ChunkCacheKey {
        ChunkCacheKey {
            partition: PartitionId::default_partition(),
            table: "tasks".to_string(),
            scope_key: "user_id=u1".to_string(),
            scope: ScopeMap::new(),
            as_of_commit_seq: CommitSeq(1),
            row_cursor: None,
            row_limit: 1000,
            encoding: "json".to_string(),
            compression: "gzip".to_string(),
        }
    }

    #[tokio::test]
    async fn identical_cache_key_is_idempotent() {
        let store = InMemorySnapshotChunkStore::new();
        let rows = vec![serde_json::json!({"title": "hi"})];
        let first = store
            .find_or_store_chunk(&key(), &rows, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        let second = store
            .find_or_store_chunk(&key(), &rows, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first.chunk_id, second.chunk_id);
    }

    #[tokio::test]
    async fn read_chunk_round_trips_rows() {
        let store = InMemorySnapshotChunkStore::new();
        let rows = vec![serde_json::json!({"title": "hi", "server_version": 1})];
        let chunk_ref = store
            .find_or_store_chunk(&key(), &rows, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        let body = store.read_chunk(&chunk_ref.chunk_id).await.unwrap().unwrap();
        let decoded = decode_row_frames(&body.compressed_bytes).unwrap();
        assert_eq!(decoded, rows);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_past_ttl_chunks() {
        let store = InMemorySnapshotChunkStore::new();
        let rows = vec![serde_json::json!({"a": 1})];
        store
            .find_or_store_chunk(&key(), &rows, std::time::Duration::from_secs(0))
            .await
            .unwrap();
        let removed = store
            .cleanup_expired(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
