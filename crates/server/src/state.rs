use std::sync::Arc;

use commitlog::{
    CommitLogStore,
    InMemoryCommitLog,
    PartitionId,
};
use handlers::HandlerRegistry;
use realtime::RealtimeRegistry;
use snapshot::SnapshotChunkStore;

use crate::config::SyncConfig;

/// Shared app state, grounded on this workspace's `LocalAppState`
/// (a single `Arc`-wrapped struct threaded through every axum handler via
/// `State<AppState>`).
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InMemoryCommitLog>,
    pub chunks: Arc<dyn SnapshotChunkStore>,
    pub registry: Arc<HandlerRegistry>,
    pub realtime: Arc<RealtimeRegistry>,
    pub config: Arc<SyncConfig>,
    pub partition: PartitionId,
}

impl AppState {
    pub fn store_as_trait(&self) -> &dyn CommitLogStore {
        self.store.as_ref()
    }
}
