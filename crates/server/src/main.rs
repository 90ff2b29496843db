use std::sync::Arc;

use clap::Parser;
use commitlog::{
    InMemoryCommitLog,
    PartitionId,
};
use handlers::{
    HandlerRegistry,
    InMemoryTableHandler,
};
use realtime::RealtimeRegistry;
use scope::ScopeValue;
use server::{
    config::SyncConfig,
    router::make_app,
    state::AppState,
};
use snapshot::InMemorySnapshotChunkStore;
use tokio::net::TcpListener;

/// Demo table set: every row scoped to its own `user_id` field, wide open
/// once authorized for that user. A real deployment registers one
/// [`InMemoryTableHandler`]-alike per table it actually serves (an external
/// collaborator decision, spec.md §1) instead of this placeholder pair.
fn demo_registry() -> anyhow::Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    for table in ["notes", "todos"] {
        let handler = InMemoryTableHandler::new(
            table,
            vec!["user_id".to_string()],
            Vec::new(),
            |row| {
                let user_id = row
                    .get("user_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("row missing user_id"))?;
                Ok(scope::ScopeMap::from([("user_id".to_string(), ScopeValue::set([user_id]))]))
            },
            |ctx| {
                let user_id = ctx
                    .auth
                    .get("user_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("missing authenticated user_id"))?;
                Ok(scope::ScopeMap::from([("user_id".to_string(), ScopeValue::set([user_id]))]))
            },
        );
        registry.register(Arc::new(handler))?;
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = SyncConfig::parse();
    let store = Arc::new(InMemoryCommitLog::new());
    let chunks: Arc<dyn snapshot::SnapshotChunkStore> = Arc::new(InMemorySnapshotChunkStore::new());
    let registry = Arc::new(demo_registry()?);
    let realtime = Arc::new(RealtimeRegistry::new());
    let partition = PartitionId::default_partition();

    let state = AppState {
        store: store.clone(),
        chunks: chunks.clone(),
        registry,
        realtime,
        config: Arc::new(config.clone()),
        partition: partition.clone(),
    };

    spawn_maintenance_loop(store, chunks, partition, config.clone());

    let app = make_app(state);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "sync server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_maintenance_loop(
    store: Arc<InMemoryCommitLog>,
    chunks: Arc<dyn snapshot::SnapshotChunkStore>,
    partition: PartitionId,
    config: SyncConfig,
) {
    let interval = config.prune_interval();
    if interval.is_zero() {
        tracing::info!("maintenance pass disabled (pruneIntervalMs=0)");
        return;
    }
    tokio::spawn(async move {
        let maintenance_config = config.maintenance_config();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now();
            match maintenance::run_maintenance(store.as_ref(), chunks.as_ref(), &partition, &maintenance_config, now).await {
                Ok(report) => tracing::info!(?report, "maintenance pass complete"),
                Err(err) => tracing::warn!(error = %err, "maintenance pass failed"),
            }
        }
    });
}
