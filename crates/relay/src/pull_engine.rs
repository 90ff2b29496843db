//! Relay pull engine (spec.md §4.10): periodically pulls upstream for the
//! relay's subscribed tables/scopes and re-applies each commit through the
//! relay's own push pipeline, so local clients that subscribe to the
//! relay see upstream changes flow through the same commit log local
//! writes do.

use client::{
    CombinedRequest,
    SyncTransport,
};
use commitlog::{
    CommitLogStore,
    CommitSeq,
    PartitionId,
};
use handlers::{
    HandlerRegistry,
    Operation,
};
use pull::{
    PullOptions,
    PullRequest,
    SubscriptionRequest,
};
use push::{
    PushRequest,
    PushStatus,
};
use scope::ScopeMap;
use serde_json::Value;

use crate::sequence_map::InMemorySequenceMap;

/// One table the relay mirrors from upstream, with the cursor it has pulled
/// up to (persisted as a `relay_config` row per spec.md §3's ownership
/// note — here, kept in-process by the caller).
#[derive(Debug, Clone)]
pub struct MirroredTable {
    pub table: String,
    pub scopes: ScopeMap,
    pub cursor: CommitSeq,
}

/// What to do when an upstream commit fails to re-apply locally
/// (spec.md §9's `onRelayPullReject` open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnRelayPullReject {
    /// Stop pulling this table and surface the error so an operator can
    /// intervene; the cursor for that table does not advance past the
    /// rejected commit.
    Halt,
    /// Log the rejection, skip past the offending commit, and keep the
    /// cursor advancing for the rest of the batch.
    Skip,
}

#[derive(Debug, Clone, Default)]
pub struct PullRoundReport {
    pub applied: usize,
    pub cached: usize,
    pub skipped: usize,
}

/// `relayPullOnce`: one round over every mirrored table. Returns the
/// updated cursors alongside the round's report; callers persist the
/// returned cursors and feed them back into the next round.
pub async fn relay_pull_once(
    transport: &dyn SyncTransport,
    local_store: &dyn CommitLogStore,
    sequence_map: &InMemorySequenceMap,
    local_registry: &HandlerRegistry,
    local_partition: &PartitionId,
    relay_id: &str,
    tables: Vec<MirroredTable>,
    limit_commits: usize,
    on_reject: OnRelayPullReject,
) -> anyhow::Result<(Vec<MirroredTable>, PullRoundReport)> {
    let subscriptions = tables
        .iter()
        .map(|t| SubscriptionRequest {
            id: t.table.clone(),
            table: t.table.clone(),
            scopes: t.scopes.clone(),
            cursor: t.cursor.0,
            bootstrap_state: None,
        })
        .collect();

    let response = transport
        .send(CombinedRequest {
            push: None,
            pull: PullRequest {
                subscriptions,
                options: PullOptions {
                    limit_commits,
                    dedupe_rows: true,
                    ..PullOptions::default()
                },
            },
        })
        .await?;

    let mut report = PullRoundReport::default();
    let mut updated = tables;

    for sub in &response.pull.subscriptions {
        let Some(mirrored) = updated.iter_mut().find(|t| t.table == sub.id) else {
            continue;
        };
        if sub.status == pull::SubscriptionStatus::Revoked {
            continue;
        }

        let mut table_cursor = mirrored.cursor;
        for commit in &sub.commits {
            let operations: Vec<Operation> = commit
                .changes
                .iter()
                .map(|change| Operation {
                    table: mirrored.table.clone(),
                    row_id: change.row_id.clone(),
                    op: change.op,
                    payload: change.row.clone(),
                    base_version: None,
                })
                .collect();
            if operations.is_empty() {
                table_cursor = commit.commit_seq;
                continue;
            }

            let client_commit_id = format!("main:{}:{}", commit.commit_seq.0, mirrored.table);
            let request = PushRequest {
                client_id: format!("relay:{relay_id}"),
                client_commit_id: client_commit_id.clone(),
                operations,
                meta: None,
            };

            let outcome = push::push_commit(
                local_store,
                local_registry,
                local_partition,
                &format!("relay:{relay_id}"),
                Value::Null,
                request,
                push::DEFAULT_MAX_OPERATIONS,
            )
            .await?;

            match outcome.response.status {
                PushStatus::Applied => {
                    let Some(local_seq) = outcome.response.commit_seq else {
                        anyhow::bail!("applied commit missing a commit-seq");
                    };
                    sequence_map.insert_confirmed(local_seq, commit.commit_seq, &mirrored.table);
                    table_cursor = commit.commit_seq;
                    report.applied += 1;
                },
                PushStatus::Cached => {
                    table_cursor = commit.commit_seq;
                    report.cached += 1;
                },
                PushStatus::Rejected => {
                    tracing::error!(
                        table = %mirrored.table,
                        upstream_commit_seq = commit.commit_seq.0,
                        "relay pull re-apply rejected"
                    );
                    match on_reject {
                        OnRelayPullReject::Halt => {
                            return Err(anyhow::anyhow!(
                                "relay pull re-apply rejected for table {} at upstream commit {}",
                                mirrored.table,
                                commit.commit_seq.0
                            ));
                        },
                        OnRelayPullReject::Skip => {
                            report.skipped += 1;
                        },
                    }
                },
            }
        }
        mirrored.cursor = table_cursor;
    }

    Ok((updated, report))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use commitlog::InMemoryCommitLog;
    use handlers::HandlerRegistry;
    use snapshot::InMemorySnapshotChunkStore;

    use super::*;

    fn upstream_with_one_commit() -> client::LocalTransport {
        let mut registry = HandlerRegistry::new();
        let handler = Arc::new(handlers::InMemoryTableHandler::new(
            "tasks",
            vec!["user_id:{userId}".to_string()],
            vec![],
            |row: &Value| {
                let mut scopes = ScopeMap::new();
                let user_id = row.get("user_id").and_then(Value::as_str).unwrap_or_default();
                scopes.insert("user_id".to_string(), scope::ScopeValue::single(user_id));
                Ok(scopes)
            },
            |_ctx: &handlers::OperationContext| Ok({
                let mut scopes = ScopeMap::new();
                scopes.insert("user_id".to_string(), scope::ScopeValue::wildcard());
                scopes
            }),
        ));
        registry.register(handler).unwrap();
        let store = InMemoryCommitLog::new();
        client::LocalTransport {
            store: Arc::new(store),
            chunks: Arc::new(InMemorySnapshotChunkStore::new()),
            registry: Arc::new(registry),
            partition: PartitionId::default_partition(),
            actor_id: "u1".to_string(),
            auth: serde_json::json!({}),
        }
    }

    fn local_registry(allow: bool) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let handler = Arc::new(handlers::InMemoryTableHandler::new(
            "tasks",
            vec!["user_id:{userId}".to_string()],
            vec![],
            |row: &Value| {
                let mut scopes = ScopeMap::new();
                let user_id = row.get("user_id").and_then(Value::as_str).unwrap_or_default();
                scopes.insert("user_id".to_string(), scope::ScopeValue::single(user_id));
                Ok(scopes)
            },
            move |_ctx: &handlers::OperationContext| {
                Ok(if allow {
                    let mut scopes = ScopeMap::new();
                    scopes.insert("user_id".to_string(), scope::ScopeValue::wildcard());
                    scopes
                } else {
                    ScopeMap::new()
                })
            },
        ));
        registry.register(handler).unwrap();
        registry
    }

    async fn seed_upstream_commit(transport: &client::LocalTransport) {
        push::push_commit(
            transport.store.as_ref(),
            transport.registry.as_ref(),
            &transport.partition,
            "u1",
            serde_json::json!({}),
            PushRequest {
                client_id: "c1".to_string(),
                client_commit_id: "k1".to_string(),
                operations: vec![Operation {
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
    }

    #[tokio::test]
    async fn applied_commit_advances_cursor_and_confirms_sequence_map() {
        let transport = upstream_with_one_commit();
        seed_upstream_commit(&transport).await;

        let local_store = InMemoryCommitLog::new();
        let local_registry = local_registry(true);
        let sequence_map = InMemorySequenceMap::new();
        let local_partition = PartitionId::default_partition();

        let tables = vec![MirroredTable {
            table: "tasks".to_string(),
            scopes: ScopeMap::from([("user_id".to_string(), scope::ScopeValue::wildcard())]),
            cursor: CommitSeq(-1),
        }];

        let (updated, report) = relay_pull_once(
            &transport,
            &local_store,
            &sequence_map,
            &local_registry,
            &local_partition,
            "edge-1",
            tables,
            pull::DEFAULT_LIMIT_COMMITS,
            OnRelayPullReject::Halt,
        )
        .await
        .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(updated[0].cursor, CommitSeq(1));
        assert_eq!(sequence_map.len(), 1);
    }

    #[tokio::test]
    async fn rejected_reapply_halts_without_advancing_cursor() {
        let transport = upstream_with_one_commit();
        seed_upstream_commit(&transport).await;

        let local_store = InMemoryCommitLog::new();
        let local_registry = local_registry(false);
        let sequence_map = InMemorySequenceMap::new();
        let local_partition = PartitionId::default_partition();

        let tables = vec![MirroredTable {
            table: "tasks".to_string(),
            scopes: ScopeMap::from([("user_id".to_string(), scope::ScopeValue::wildcard())]),
            cursor: CommitSeq(-1),
        }];

        let err = relay_pull_once(
            &transport,
            &local_store,
            &sequence_map,
            &local_registry,
            &local_partition,
            "edge-1",
            tables.clone(),
            pull::DEFAULT_LIMIT_COMMITS,
            OnRelayPullReject::Halt,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert!(sequence_map.is_empty());

        // A retry with the unchanged cursor sees the same commit again.
        assert_eq!(tables[0].cursor, CommitSeq(-1));
    }
}
