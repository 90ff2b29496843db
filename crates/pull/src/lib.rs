//! Pull pipeline (spec.md §4.6, component C6): per-subscription scope
//! resolution, paginated bootstrap snapshots via [`snapshot::SnapshotChunkStore`],
//! and incremental commit-log scanning via [`commitlog::CommitLogStore`].

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    time::Duration,
};

use commitlog::{
    CommitLogStore,
    CommitSeq,
    PartitionId,
};
use errors::SyncError;
use handlers::{
    HandlerRegistry,
    OperationContext,
};
use scope::ScopeMap;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;
use snapshot::{
    ChunkCacheKey,
    SnapshotChunkStore,
};

pub const DEFAULT_LIMIT_COMMITS: usize = 50;
pub const MAX_LIMIT_COMMITS: usize = 500;
pub const DEFAULT_LIMIT_SNAPSHOT_ROWS: usize = 1000;
pub const MAX_LIMIT_SNAPSHOT_ROWS: usize = 5000;
pub const DEFAULT_MAX_SNAPSHOT_PAGES: usize = 4;
pub const MAX_MAX_SNAPSHOT_PAGES: usize = 10;
const CHUNK_TTL: Duration = Duration::from_secs(3600);

/// Clamps a caller-supplied limit into `[1, max]`, falling back to
/// `default` for non-finite or non-positive input (spec.md §4.6 "Clamp
/// policy").
pub fn clamp_limit(value: Option<f64>, default: usize, max: usize) -> usize {
    match value {
        Some(v) if v.is_finite() && v >= 1.0 => (v as usize).min(max),
        _ => default,
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub id: String,
    pub table: String,
    pub scopes: ScopeMap,
    pub cursor: i64,
    pub bootstrap_state: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct PullOptions {
    pub limit_commits: usize,
    pub limit_snapshot_rows: usize,
    pub max_snapshot_pages: usize,
    pub dedupe_rows: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            limit_commits: DEFAULT_LIMIT_COMMITS,
            limit_snapshot_rows: DEFAULT_LIMIT_SNAPSHOT_ROWS,
            max_snapshot_pages: DEFAULT_MAX_SNAPSHOT_PAGES,
            dedupe_rows: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullRequest {
    pub subscriptions: Vec<SubscriptionRequest>,
    pub options: PullOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone)]
pub struct ChangePayload {
    pub change_id: i64,
    pub row_id: String,
    pub op: commitlog::RowOp,
    pub row: Option<Value>,
    pub row_version: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CommitPayload {
    pub commit_seq: CommitSeq,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub actor_id: String,
    pub changes: Vec<ChangePayload>,
}

#[derive(Debug, Clone)]
pub struct ChunkSummary {
    pub id: String,
    pub sha256: String,
    pub byte_length: usize,
    pub encoding: String,
    pub compression: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotPayload {
    pub table: String,
    pub is_first_page: bool,
    pub is_last_page: bool,
    pub chunks: Vec<ChunkSummary>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionResult {
    pub id: String,
    pub status: SubscriptionStatus,
    pub scopes: ScopeMap,
    pub bootstrap: bool,
    pub bootstrap_state: Option<Value>,
    pub next_cursor: CommitSeq,
    pub commits: Vec<CommitPayload>,
    pub snapshots: Vec<SnapshotPayload>,
}

pub struct PullOutcome {
    pub subscriptions: Vec<SubscriptionResult>,
    pub effective_scopes: ScopeMap,
    pub client_cursor: CommitSeq,
}

/// Opaque resumption token for an in-progress bootstrap, serialized into
/// the subscription's `bootstrapState` field on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootstrapState {
    as_of_commit_seq: CommitSeq,
    closure: Vec<String>,
    table_idx: usize,
    row_cursor: Option<String>,
}

/// `pull({auth, request})`.
pub async fn pull(
    store: &dyn CommitLogStore,
    chunks: &dyn SnapshotChunkStore,
    registry: &HandlerRegistry,
    partition: &PartitionId,
    actor_id: &str,
    auth: Value,
    request: PullRequest,
) -> anyhow::Result<PullOutcome> {
    let ctx = OperationContext {
        partition: partition.clone(),
        actor_id: actor_id.to_string(),
        auth,
    };

    let mut results = Vec::with_capacity(request.subscriptions.len());
    let mut effective_scopes = ScopeMap::new();
    let mut min_cursor: Option<CommitSeq> = None;

    for sub in &request.subscriptions {
        let result = pull_subscription(store, chunks, registry, &ctx, sub, &request.options).await?;
        if result.status == SubscriptionStatus::Active {
            for (key, value) in &result.scopes {
                effective_scopes
                    .entry(key.clone())
                    .and_modify(|existing| *existing = union_scope_value(existing, value))
                    .or_insert_with(|| value.clone());
            }
        }
        if result.status == SubscriptionStatus::Active {
            min_cursor = Some(match min_cursor {
                Some(current) if current.0 <= result.next_cursor.0 => current,
                _ => result.next_cursor,
            });
        }
        results.push(result);
    }

    Ok(PullOutcome {
        subscriptions: results,
        effective_scopes,
        client_cursor: min_cursor.unwrap_or(CommitSeq::NONE),
    })
}

fn union_scope_value(a: &scope::ScopeValue, b: &scope::ScopeValue) -> scope::ScopeValue {
    if a.is_wildcard() || b.is_wildcard() {
        return scope::ScopeValue::wildcard();
    }
    let mut values: BTreeSet<String> = BTreeSet::new();
    if let Some(v) = a.values() {
        values.extend(v.into_iter().map(str::to_string));
    }
    if let Some(v) = b.values() {
        values.extend(v.into_iter().map(str::to_string));
    }
    scope::ScopeValue::set(values)
}

async fn pull_subscription(
    store: &dyn CommitLogStore,
    chunks: &dyn SnapshotChunkStore,
    registry: &HandlerRegistry,
    ctx: &OperationContext,
    sub: &SubscriptionRequest,
    options: &PullOptions,
) -> anyhow::Result<SubscriptionResult> {
    let handler = registry
        .get(&sub.table)
        .ok_or_else(|| SyncError::invalid_request(format!("unknown table {}", sub.table)))?;

    let allowed = handler.resolve_scopes(ctx)?;
    scope::validate_known_keys(&sub.scopes, &allowed, &handler.declared_scope_keys())?;

    let requested = scope::intersect(&sub.scopes, &allowed);
    let Some(requested) = requested.filter(|s| !s.is_empty()) else {
        return Ok(SubscriptionResult {
            id: sub.id.clone(),
            status: SubscriptionStatus::Revoked,
            scopes: ScopeMap::new(),
            bootstrap: false,
            bootstrap_state: None,
            next_cursor: CommitSeq(sub.cursor),
            commits: vec![],
            snapshots: vec![],
        });
    };

    let max_commit_seq = store.read_max_commit_seq(&ctx.partition).await?;
    let is_bootstrap = sub.cursor < 0 || sub.cursor > max_commit_seq.0;

    if is_bootstrap {
        tracing::debug!(subscription = %sub.id, table = %sub.table, cursor = sub.cursor, "entering bootstrap mode");
        return bootstrap_subscription(
            chunks,
            registry,
            ctx,
            sub,
            &requested,
            max_commit_seq,
            options,
        )
        .await;
    }

    incremental_subscription(store, ctx, sub, &requested, options).await
}

async fn bootstrap_subscription(
    chunks: &dyn SnapshotChunkStore,
    registry: &HandlerRegistry,
    ctx: &OperationContext,
    sub: &SubscriptionRequest,
    requested: &ScopeMap,
    max_commit_seq: CommitSeq,
    options: &PullOptions,
) -> anyhow::Result<SubscriptionResult> {
    let mut state = match &sub.bootstrap_state {
        Some(value) => serde_json::from_value::<BootstrapState>(value.clone())?,
        None => BootstrapState {
            as_of_commit_seq: max_commit_seq,
            closure: dependency_closure(registry, &sub.table)?,
            table_idx: 0,
            row_cursor: None,
        },
    };

    let mut snapshots = Vec::new();
    let mut pages_emitted = 0;

    while pages_emitted < options.max_snapshot_pages && state.table_idx < state.closure.len() {
        let table = state.closure[state.table_idx].clone();
        let table_handler = registry
            .get(&table)
            .ok_or_else(|| SyncError::internal(format!("handler vanished for table {table}")))?;

        let is_first_page = state.row_cursor.is_none();
        let page = table_handler.snapshot(
            ctx,
            requested,
            state.row_cursor.as_deref(),
            options.limit_snapshot_rows,
        )?;
        let is_last_page = page.next_cursor.is_none();

        let chunk_ref = chunks
            .find_or_store_chunk(
                &ChunkCacheKey {
                    partition: ctx.partition.clone(),
                    table: table.clone(),
                    scope_key: scope::scope_key(requested),
                    scope: requested.clone(),
                    as_of_commit_seq: state.as_of_commit_seq,
                    row_cursor: state.row_cursor.clone(),
                    row_limit: options.limit_snapshot_rows,
                    encoding: "json-row-frame-v1".to_string(),
                    compression: "gzip".to_string(),
                },
                &page.rows,
                CHUNK_TTL,
            )
            .await?;

        snapshots.push(SnapshotPayload {
            table: table.clone(),
            is_first_page,
            is_last_page,
            chunks: vec![ChunkSummary {
                id: chunk_ref.chunk_id,
                sha256: chunk_ref.sha256,
                byte_length: chunk_ref.byte_length,
                encoding: chunk_ref.encoding,
                compression: chunk_ref.compression,
            }],
        });

        pages_emitted += 1;
        if is_last_page {
            state.table_idx += 1;
            state.row_cursor = None;
        } else {
            state.row_cursor = page.next_cursor;
        }
    }

    let done = state.table_idx >= state.closure.len();
    Ok(SubscriptionResult {
        id: sub.id.clone(),
        status: SubscriptionStatus::Active,
        scopes: requested.clone(),
        bootstrap: true,
        bootstrap_state: if done {
            None
        } else {
            Some(serde_json::to_value(&state)?)
        },
        next_cursor: if done {
            state.as_of_commit_seq
        } else {
            CommitSeq(sub.cursor.max(0))
        },
        commits: vec![],
        snapshots,
    })
}

async fn incremental_subscription(
    store: &dyn CommitLogStore,
    ctx: &OperationContext,
    sub: &SubscriptionRequest,
    requested: &ScopeMap,
    options: &PullOptions,
) -> anyhow::Result<SubscriptionResult> {
    let after = CommitSeq(sub.cursor.max(0));
    let scanned = store
        .scan_table_commits_after(&ctx.partition, &sub.table, after, options.limit_commits)
        .await?;

    let next_cursor = scanned.last().copied().unwrap_or(after);

    if scanned.is_empty() {
        return Ok(SubscriptionResult {
            id: sub.id.clone(),
            status: SubscriptionStatus::Active,
            scopes: requested.clone(),
            bootstrap: false,
            bootstrap_state: None,
            next_cursor,
            commits: vec![],
            snapshots: vec![],
        });
    }

    let changes = store
        .read_changes_for_commits(&ctx.partition, &sub.table, &scanned, requested)
        .await?;

    let mut by_commit: BTreeMap<CommitSeq, Vec<commitlog::ChangeRow>> = BTreeMap::new();
    if options.dedupe_rows {
        let mut latest_by_row: BTreeMap<String, commitlog::ChangeRow> = BTreeMap::new();
        for change in changes {
            latest_by_row.insert(change.row_id.clone(), change);
        }
        for change in latest_by_row.into_values() {
            by_commit.entry(change.commit_seq).or_default().push(change);
        }
    } else {
        for change in changes {
            by_commit.entry(change.commit_seq).or_default().push(change);
        }
    }

    let mut commits = Vec::with_capacity(by_commit.len());
    for (commit_seq, rows) in by_commit {
        let Some(commit) = store.read_commit(&ctx.partition, commit_seq).await? else {
            continue;
        };
        commits.push(CommitPayload {
            commit_seq,
            created_at: commit.created_at,
            actor_id: commit.actor_id,
            changes: rows
                .into_iter()
                .map(|row| ChangePayload {
                    change_id: row.change_id.0,
                    row_id: row.row_id,
                    op: row.op,
                    row: row.row,
                    row_version: row.row_version,
                })
                .collect(),
        });
    }
    commits.sort_by_key(|c| c.commit_seq);

    Ok(SubscriptionResult {
        id: sub.id.clone(),
        status: SubscriptionStatus::Active,
        scopes: requested.clone(),
        bootstrap: false,
        bootstrap_state: None,
        next_cursor,
        commits,
        snapshots: vec![],
    })
}

/// Every table on a path from `table` back through `dependsOn` edges,
/// ordered so dependencies always precede their dependents, matching
/// [`HandlerRegistry::topological_order`]'s overall order restricted to
/// this closure.
fn dependency_closure(registry: &HandlerRegistry, table: &str) -> anyhow::Result<Vec<String>> {
    let full_order = registry.topological_order()?;
    let mut closure = BTreeSet::new();
    let mut stack = vec![table.to_string()];
    while let Some(t) = stack.pop() {
        if !closure.insert(t.clone()) {
            continue;
        }
        if let Some(handler) = registry.get(&t) {
            for dep in handler.depends_on() {
                stack.push(dep.clone());
            }
        }
    }
    Ok(full_order.into_iter().filter(|t| closure.contains(t)).collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use commitlog::InMemoryCommitLog;
    use handlers::{
        HandlerRegistry,
        InMemoryTableHandler,
    };
    use push::{
        push_commit,
        PushRequest,
    };
    use snapshot::InMemorySnapshotChunkStore;

    use super::*;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let handler = Arc::new(InMemoryTableHandler::new(
            "tasks",
            vec!["user_id:{userId}".to_string()],
            vec![],
            |row: &Value| {
                let mut scopes = ScopeMap::new();
                scopes.insert(
                    "user_id".to_string(),
                    scope::ScopeValue::single(row.get("user_id").and_then(Value::as_str).unwrap_or_default()),
                );
                Ok(scopes)
            },
            |ctx: &OperationContext| {
                let mut scopes = ScopeMap::new();
                scopes.insert(
                    "user_id".to_string(),
                    scope::ScopeValue::single(ctx.auth.get("user_id").and_then(Value::as_str).unwrap_or_default()),
                );
                Ok(scopes)
            },
        ));
        registry.register(handler).unwrap();
        registry
    }

    fn sub_request(cursor: i64) -> SubscriptionRequest {
        SubscriptionRequest {
            id: "s1".to_string(),
            table: "tasks".to_string(),
            scopes: ScopeMap::from([("user_id".to_string(), scope::ScopeValue::single("u1"))]),
            cursor,
            bootstrap_state: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_then_pull_yields_one_snapshot_row() {
        let store = InMemoryCommitLog::new();
        let chunks = InMemorySnapshotChunkStore::new();
        let registry = registry();
        let partition = PartitionId::default_partition();

        push_commit(
            &store,
            &registry,
            &partition,
            "u1",
            serde_json::json!({"user_id": "u1"}),
            PushRequest {
                client_id: "c1".to_string(),
                client_commit_id: "k1".to_string(),
                operations: vec![handlers::Operation {
                    table: "tasks".to_string(),
                    row_id: "t1".to_string(),
                    op: commitlog::RowOp::Upsert,
                    payload: Some(serde_json::json!({"title": "Hello", "user_id": "u1"})),
                    base_version: None,
                }],
                meta: None,
            },
            push::DEFAULT_MAX_OPERATIONS,
        )
        .await
        .unwrap();

        let outcome = pull(
            &store,
            &chunks,
            &registry,
            &partition,
            "u1",
            serde_json::json!({"user_id": "u1"}),
            PullRequest {
                subscriptions: vec![sub_request(-1)],
                options: PullOptions::default(),
            },
        )
        .await
        .unwrap();

        let sub = &outcome.subscriptions[0];
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.bootstrap);
        assert!(sub.bootstrap_state.is_none());
        assert_eq!(sub.next_cursor, CommitSeq(1));
        assert_eq!(sub.snapshots.len(), 1);
        assert_eq!(sub.snapshots[0].chunks.len(), 1);

        let body = chunks
            .read_chunk(&sub.snapshots[0].chunks[0].id)
            .await
            .unwrap()
            .unwrap();
        let rows = snapshot::decode_row_frames(&body.compressed_bytes).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "Hello");
    }

    #[tokio::test]
    async fn cursor_advances_on_scope_miss() {
        let store = InMemoryCommitLog::new();
        let registry = registry();
        let partition = PartitionId::default_partition();

        for (actor, key) in [("u1", "k0"), ("u2", "k1"), ("u2", "k2"), ("u2", "k3")] {
            push_commit(
                &store,
                &registry,
                &partition,
                actor,
                serde_json::json!({"user_id": actor}),
                PushRequest {
                    client_id: actor.to_string(),
                    client_commit_id: key.to_string(),
                    operations: vec![handlers::Operation {
                        table: "tasks".to_string(),
                        row_id: format!("t-{key}"),
                        op: commitlog::RowOp::Upsert,
                        payload: Some(serde_json::json!({"title": "x", "user_id": actor})),
                        base_version: None,
                    }],
                    meta: None,
                },
                push::DEFAULT_MAX_OPERATIONS,
            )
            .await
            .unwrap();
        }

        let result = incremental_subscription(
            &store,
            &OperationContext {
                partition: partition.clone(),
                actor_id: "u1".to_string(),
                auth: serde_json::json!({"user_id": "u1"}),
            },
            &sub_request(1),
            &ScopeMap::from([("user_id".to_string(), scope::ScopeValue::single("u1"))]),
            &PullOptions {
                limit_commits: 2,
                ..PullOptions::default()
            },
        )
        .await
        .unwrap();

        assert!(result.commits.is_empty());
        assert_eq!(result.next_cursor, CommitSeq(3));
    }

    #[tokio::test]
    async fn revoked_scope_returns_empty_active_subscription_as_revoked() {
        let store = InMemoryCommitLog::new();
        let chunks = InMemorySnapshotChunkStore::new();
        let mut registry = HandlerRegistry::new();
        let handler = Arc::new(InMemoryTableHandler::new(
            "tasks",
            vec!["user_id".to_string()],
            vec![],
            |_row: &Value| Ok(ScopeMap::new()),
            |_ctx: &OperationContext| Ok(ScopeMap::new()),
        ));
        registry.register(handler).unwrap();
        let partition = PartitionId::default_partition();

        let outcome = pull(
            &store,
            &chunks,
            &registry,
            &partition,
            "u2",
            serde_json::json!({"user_id": "u2"}),
            PullRequest {
                subscriptions: vec![sub_request(-1)],
                options: PullOptions::default(),
            },
        )
        .await
        .unwrap();

        let sub = &outcome.subscriptions[0];
        assert_eq!(sub.status, SubscriptionStatus::Revoked);
        assert!(sub.scopes.is_empty());
        assert!(sub.commits.is_empty());
    }

    #[tokio::test]
    async fn revoked_never_bootstrapped_subscription_keeps_bootstrap_sentinel() {
        let store = InMemoryCommitLog::new();
        let chunks = InMemorySnapshotChunkStore::new();
        let mut registry = HandlerRegistry::new();
        let handler = Arc::new(InMemoryTableHandler::new(
            "tasks",
            vec!["user_id".to_string()],
            vec![],
            |_row: &Value| Ok(ScopeMap::new()),
            |_ctx: &OperationContext| Ok(ScopeMap::new()),
        ));
        registry.register(handler).unwrap();
        let partition = PartitionId::default_partition();

        let outcome = pull(
            &store,
            &chunks,
            &registry,
            &partition,
            "u2",
            serde_json::json!({"user_id": "u2"}),
            PullRequest {
                subscriptions: vec![sub_request(-1)],
                options: PullOptions::default(),
            },
        )
        .await
        .unwrap();

        let sub = &outcome.subscriptions[0];
        assert_eq!(sub.status, SubscriptionStatus::Revoked);
        assert_eq!(sub.next_cursor, CommitSeq(-1));
    }

    #[tokio::test]
    async fn client_cursor_ignores_revoked_subscriptions() {
        let store = InMemoryCommitLog::new();
        let chunks = InMemorySnapshotChunkStore::new();
        let registry = registry();
        let partition = PartitionId::default_partition();

        push_commit(
            &store,
            &registry,
            &partition,
            "u1",
            serde_json::json!({"user_id": "u1"}),
            PushRequest {
                client_id: "c1".to_string(),
                client_commit_id: "k1".to_string(),
                operations: vec![handlers::Operation {
                    table: "tasks".to_string(),
                    row_id: "t1".to_string(),
                    op: commitlog::RowOp::Upsert,
                    payload: Some(serde_json::json!({"title": "hi", "user_id": "u1"})),
                    base_version: None,
                }],
                meta: None,
            },
            push::DEFAULT_MAX_OPERATIONS,
        )
        .await
        .unwrap();

        let active = SubscriptionRequest {
            id: "active".to_string(),
            table: "tasks".to_string(),
            scopes: ScopeMap::from([("user_id".to_string(), scope::ScopeValue::single("u1"))]),
            cursor: 0,
            bootstrap_state: None,
        };
        let revoked = SubscriptionRequest {
            id: "revoked".to_string(),
            table: "tasks".to_string(),
            scopes: ScopeMap::from([("user_id".to_string(), scope::ScopeValue::single("u2"))]),
            cursor: -1,
            bootstrap_state: None,
        };

        let outcome = pull(
            &store,
            &chunks,
            &registry,
            &partition,
            "u1",
            serde_json::json!({"user_id": "u1"}),
            PullRequest {
                subscriptions: vec![active, revoked],
                options: PullOptions::default(),
            },
        )
        .await
        .unwrap();

        let active_result = outcome.subscriptions.iter().find(|s| s.id == "active").unwrap();
        let revoked_result = outcome.subscriptions.iter().find(|s| s.id == "revoked").unwrap();
        assert_eq!(active_result.status, SubscriptionStatus::Active);
        assert_eq!(revoked_result.status, SubscriptionStatus::Revoked);
        assert_eq!(revoked_result.next_cursor, CommitSeq(-1));
        assert_eq!(outcome.client_cursor, active_result.next_cursor);
    }

    #[tokio::test]
    async fn dedupe_rows_collapses_to_latest_change_per_row() {
        let store = InMemoryCommitLog::new();
        let registry = registry();
        let partition = PartitionId::default_partition();

        push_commit(
            &store,
            &registry,
            &partition,
            "u1",
            serde_json::json!({"user_id": "u1"}),
            PushRequest {
                client_id: "c1".to_string(),
                client_commit_id: "k1".to_string(),
                operations: vec![handlers::Operation {
                    table: "tasks".to_string(),
                    row_id: "t1".to_string(),
                    op: commitlog::RowOp::Upsert,
                    payload: Some(serde_json::json!({"title": "v1", "user_id": "u1"})),
                    base_version: None,
                }],
                meta: None,
            },
            push::DEFAULT_MAX_OPERATIONS,
        )
        .await
        .unwrap();

        for title in ["v2", "v3", "v4"] {
            push_commit(
                &store,
                &registry,
                &partition,
                "u1",
                serde_json::json!({"user_id": "u1"}),
                PushRequest {
                    client_id: "c1".to_string(),
                    client_commit_id: format!("k-{title}"),
                    operations: vec![handlers::Operation {
                        table: "tasks".to_string(),
                        row_id: "t1".to_string(),
                        op: commitlog::RowOp::Upsert,
                        payload: Some(serde_json::json!({"title": title, "user_id": "u1"})),
                        base_version: None,
                    }],
                    meta: None,
                },
                push::DEFAULT_MAX_OPERATIONS,
            )
            .await
            .unwrap();
        }

        let result = incremental_subscription(
            &store,
            &OperationContext {
                partition: partition.clone(),
                actor_id: "u1".to_string(),
                auth: serde_json::json!({"user_id": "u1"}),
            },
            &sub_request(1),
            &ScopeMap::from([("user_id".to_string(), scope::ScopeValue::single("u1"))]),
            &PullOptions {
                dedupe_rows: true,
                ..PullOptions::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.next_cursor, CommitSeq(4));
        assert_eq!(result.commits.len(), 1);
        let commit = &result.commits[0];
        assert_eq!(commit.commit_seq, CommitSeq(4));
        assert_eq!(commit.changes.len(), 1);
        assert_eq!(commit.changes[0].row.as_ref().unwrap()["title"], "v4");
    }

    #[tokio::test]
    async fn bootstrap_emits_snapshots_in_dependency_order() {
        let store = InMemoryCommitLog::new();
        let chunks = InMemorySnapshotChunkStore::new();
        let mut registry = HandlerRegistry::new();

        let projects = Arc::new(InMemoryTableHandler::new(
            "projects",
            vec!["user_id".to_string()],
            vec![],
            |row: &Value| {
                Ok(ScopeMap::from([(
                    "user_id".to_string(),
                    scope::ScopeValue::single(row.get("user_id").and_then(Value::as_str).unwrap_or_default()),
                )]))
            },
            |ctx: &OperationContext| {
                Ok(ScopeMap::from([(
                    "user_id".to_string(),
                    scope::ScopeValue::single(ctx.auth.get("user_id").and_then(Value::as_str).unwrap_or_default()),
                )]))
            },
        ));
        projects.seed(
            "p1",
            serde_json::json!({"name": "Roadmap", "user_id": "u1"}),
            1,
            ScopeMap::from([("user_id".to_string(), scope::ScopeValue::single("u1"))]),
        );
        registry.register(projects).unwrap();

        let tasks = Arc::new(InMemoryTableHandler::new(
            "tasks",
            vec!["user_id".to_string()],
            vec!["projects".to_string()],
            |row: &Value| {
                Ok(ScopeMap::from([(
                    "user_id".to_string(),
                    scope::ScopeValue::single(row.get("user_id").and_then(Value::as_str).unwrap_or_default()),
                )]))
            },
            |ctx: &OperationContext| {
                Ok(ScopeMap::from([(
                    "user_id".to_string(),
                    scope::ScopeValue::single(ctx.auth.get("user_id").and_then(Value::as_str).unwrap_or_default()),
                )]))
            },
        ));
        tasks.seed(
            "t1",
            serde_json::json!({"title": "Ship it", "user_id": "u1"}),
            1,
            ScopeMap::from([("user_id".to_string(), scope::ScopeValue::single("u1"))]),
        );
        registry.register(tasks).unwrap();

        let partition = PartitionId::default_partition();
        let outcome = pull(
            &store,
            &chunks,
            &registry,
            &partition,
            "u1",
            serde_json::json!({"user_id": "u1"}),
            PullRequest {
                subscriptions: vec![sub_request(-1)],
                options: PullOptions::default(),
            },
        )
        .await
        .unwrap();

        let sub = &outcome.subscriptions[0];
        assert_eq!(sub.snapshots.len(), 2);
        assert_eq!(sub.snapshots[0].table, "projects");
        assert_eq!(sub.snapshots[1].table, "tasks");

        let projects_body = chunks
            .read_chunk(&sub.snapshots[0].chunks[0].id)
            .await
            .unwrap()
            .unwrap();
        let project_rows = snapshot::decode_row_frames(&projects_body.compressed_bytes).unwrap();
        assert_eq!(project_rows[0]["name"], "Roadmap");

        let tasks_body = chunks
            .read_chunk(&sub.snapshots[1].chunks[0].id)
            .await
            .unwrap()
            .unwrap();
        let task_rows = snapshot::decode_row_frames(&tasks_body.compressed_bytes).unwrap();
        assert_eq!(task_rows[0]["title"], "Ship it");
    }
}
