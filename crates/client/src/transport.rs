use std::sync::Arc;

use async_trait::async_trait;
use commitlog::{
    CommitLogStore,
    PartitionId,
};
use handlers::HandlerRegistry;
use snapshot::SnapshotChunkStore;

#[derive(Default)]
pub struct CombinedRequest {
    pub push: Option<push::PushRequest>,
    pub pull: pull::PullRequest,
}

pub struct CombinedResponse {
    pub push: Option<push::PushOutcome>,
    pub pull: pull::PullOutcome,
}

/// The wire boundary of spec.md §6's combined `/sync` call. A production
/// client speaks this over HTTP (see the `server` crate's axum handler);
/// [`LocalTransport`] is the in-process reference used by single-process
/// deployments and by every test in this workspace.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, request: CombinedRequest) -> anyhow::Result<CombinedResponse>;

    /// Fetches a bootstrap chunk's compressed body by id (spec.md §6 `GET
    /// /sync/snapshot-chunks/{chunkId}`).
    async fn fetch_chunk(&self, chunk_id: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct LocalTransport {
    pub store: Arc<dyn CommitLogStore>,
    pub chunks: Arc<dyn SnapshotChunkStore>,
    pub registry: Arc<HandlerRegistry>,
    pub partition: PartitionId,
    pub actor_id: String,
    pub auth: serde_json::Value,
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn send(&self, request: CombinedRequest) -> anyhow::Result<CombinedResponse> {
        let push_outcome = match request.push {
            Some(push_request) => Some(
                push::push_commit(
                    self.store.as_ref(),
                    self.registry.as_ref(),
                    &self.partition,
                    &self.actor_id,
                    self.auth.clone(),
                    push_request,
                    push::DEFAULT_MAX_OPERATIONS,
                )
                .await?,
            ),
            None => None,
        };

        let pull_outcome = pull::pull(
            self.store.as_ref(),
            self.chunks.as_ref(),
            self.registry.as_ref(),
            &self.partition,
            &self.actor_id,
            self.auth.clone(),
            request.pull,
        )
        .await?;

        Ok(CombinedResponse {
            push: push_outcome,
            pull: pull_outcome,
        })
    }

    async fn fetch_chunk(&self, chunk_id: &str) -> anyhow::Result<Vec<u8>> {
        let body = self
            .chunks
            .read_chunk(chunk_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("chunk {chunk_id} not found"))?;
        Ok(body.compressed_bytes)
    }
}
