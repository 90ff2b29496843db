//! Push pipeline (spec.md §4.5, component C5): validates a batch of
//! operations, authorizes each one against its handler's declared scopes,
//! dispatches to [`handlers::TableHandler::apply_operation`], and commits
//! the whole batch atomically through a [`commitlog::CommitLogStore`].

use std::collections::BTreeSet;

use commitlog::{
    AppendOutcome,
    Commit,
    CommitLogStore,
    CommitSeq,
    NewChange,
    PartitionId,
};
use errors::{
    SyncError,
    SyncErrorCode,
};
use handlers::{
    ApplyOutcome,
    HandlerRegistry,
    Operation,
    OperationContext,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;

pub const DEFAULT_MAX_OPERATIONS: usize = 200;

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub client_id: String,
    pub client_commit_id: String,
    pub operations: Vec<Operation>,
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    Applied,
    Cached,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpResult {
    Applied {
        op_index: usize,
        result: Value,
    },
    Conflict {
        op_index: usize,
        server_version: u64,
        server_row: Value,
        message: String,
    },
    Error {
        op_index: usize,
        code: SyncErrorCode,
        message: String,
        retriable: bool,
    },
}

impl OpResult {
    pub fn op_index(&self) -> usize {
        match self {
            OpResult::Applied { op_index, .. }
            | OpResult::Conflict { op_index, .. }
            | OpResult::Error { op_index, .. } => *op_index,
        }
    }

    fn blocks_commit(&self) -> bool {
        match self {
            OpResult::Applied { .. } => false,
            OpResult::Conflict { .. } => true,
            OpResult::Error { retriable, .. } => !retriable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushResponse {
    pub status: PushStatus,
    pub commit_seq: Option<CommitSeq>,
    pub results: Vec<OpResult>,
}

#[derive(Debug)]
pub struct PushOutcome {
    pub response: PushResponse,
    pub affected_tables: Vec<String>,
}

/// `pushCommit({partition, auth, request})`.
pub async fn push_commit(
    store: &dyn CommitLogStore,
    registry: &HandlerRegistry,
    partition: &PartitionId,
    actor_id: &str,
    auth: Value,
    request: PushRequest,
    max_operations: usize,
) -> anyhow::Result<PushOutcome> {
    if request.client_commit_id.trim().is_empty() {
        return Err(SyncError::invalid_request("clientCommitId must not be empty").into());
    }
    if request.operations.len() > max_operations {
        return Err(SyncError::invalid_request(format!(
            "operations batch of {} exceeds limit of {max_operations}",
            request.operations.len()
        ))
        .into());
    }
    for op in &request.operations {
        if op.table.trim().is_empty() || op.row_id.trim().is_empty() {
            return Err(SyncError::invalid_request(
                "every operation requires a table and row-id",
            )
            .into());
        }
    }

    if let Some(cached) = store
        .find_cached_commit(partition, &request.client_id, &request.client_commit_id)
        .await?
    {
        return Ok(cached_push_outcome(cached));
    }

    let ctx = OperationContext {
        partition: partition.clone(),
        actor_id: actor_id.to_string(),
        auth,
    };

    let mut results = Vec::with_capacity(request.operations.len());
    let mut emitted_changes = Vec::new();
    let mut affected_tables = BTreeSet::new();

    for (op_index, op) in request.operations.iter().enumerate() {
        let Some(handler) = registry.get(&op.table) else {
            results.push(OpResult::Error {
                op_index,
                code: SyncErrorCode::InvalidRequest,
                message: format!("no handler registered for table {}", op.table),
                retriable: false,
            });
            continue;
        };

        if let Err(err) = authorize_operation(handler.as_ref(), &ctx, op) {
            results.push(OpResult::Error {
                op_index,
                code: SyncErrorCode::UnauthorizedScope,
                message: err.to_string(),
                retriable: false,
            });
            continue;
        }

        match handler.apply_operation(&ctx, op, op_index) {
            Ok(ApplyOutcome::Applied {
                emitted_changes: changes,
                result,
                ..
            }) => {
                affected_tables.extend(changes.iter().map(|c| c.table.clone()));
                emitted_changes.extend(changes);
                results.push(OpResult::Applied { op_index, result });
            },
            Ok(ApplyOutcome::Conflict {
                server_version,
                server_row,
                message,
            }) => {
                results.push(OpResult::Conflict {
                    op_index,
                    server_version,
                    server_row,
                    message,
                });
            },
            Ok(ApplyOutcome::Error { code, message }) => {
                results.push(OpResult::Error {
                    op_index,
                    retriable: code.is_retriable(),
                    code,
                    message,
                });
            },
            Err(err) => {
                tracing::warn!(table = %op.table, row_id = %op.row_id, error = %err, "handler raised while applying operation");
                results.push(OpResult::Error {
                    op_index,
                    code: SyncErrorCode::Transient,
                    message: err.to_string(),
                    retriable: true,
                });
            },
        }
    }

    if results.iter().any(OpResult::blocks_commit) {
        return Ok(PushOutcome {
            response: PushResponse {
                status: PushStatus::Rejected,
                commit_seq: None,
                results,
            },
            affected_tables: vec![],
        });
    }

    let commit_result = serde_json::json!({ "results": results });

    let outcome = store
        .append_commit(
            partition,
            actor_id,
            &request.client_id,
            &request.client_commit_id,
            request.meta,
            commit_result,
            emitted_changes,
        )
        .await?;

    // A concurrent push under the same idempotency key can race the check
    // above; `append_commit`'s own lock is what's actually atomic, so a
    // `Cached` outcome here still must not surface this call's re-dispatched
    // `results` (property P1).
    match outcome {
        AppendOutcome::Applied { commit_seq, .. } => Ok(PushOutcome {
            response: PushResponse {
                status: PushStatus::Applied,
                commit_seq: Some(commit_seq),
                results,
            },
            affected_tables: affected_tables.into_iter().collect(),
        }),
        AppendOutcome::Cached { commit_seq, result } => Ok(PushOutcome {
            response: PushResponse {
                status: PushStatus::Cached,
                commit_seq: Some(commit_seq),
                results: results_from_commit_result(&result),
            },
            affected_tables: vec![],
        }),
    }
}

/// Intersects the handler's `resolveScopes(ctx)` against the scopes the
/// operation's row actually carries; an empty intersection is the
/// `UNAUTHORIZED_SCOPE` rejection path of spec.md §4.5.
fn authorize_operation(
    handler: &dyn handlers::TableHandler,
    ctx: &OperationContext,
    op: &Operation,
) -> anyhow::Result<()> {
    let allowed = handler.resolve_scopes(ctx)?;
    let row_scopes = match (&op.op, &op.payload) {
        (commitlog::RowOp::Upsert, Some(payload)) => handler.extract_scopes(payload)?,
        _ => allowed.clone(),
    };
    match scope::intersect(&row_scopes, &allowed) {
        Some(intersected) if !intersected.is_empty() => Ok(()),
        _ => Err(SyncError::unauthorized_scope(format!(
            "actor {} is not authorized for row {} of table {}",
            ctx.actor_id, op.row_id, op.table
        ))
        .into()),
    }
}

/// Rebuilds the response a prior call with this idempotency key produced,
/// without re-running `authorize_operation` or `apply_operation` (spec.md
/// §4.5, property P1: a replay must not re-dispatch to handlers).
fn cached_push_outcome(commit: Commit) -> PushOutcome {
    PushOutcome {
        response: PushResponse {
            status: PushStatus::Cached,
            commit_seq: Some(commit.commit_seq),
            results: results_from_commit_result(&commit.result),
        },
        affected_tables: vec![],
    }
}

fn results_from_commit_result(result: &Value) -> Vec<OpResult> {
    result
        .get("results")
        .cloned()
        .map(|value| serde_json::from_value(value).unwrap_or_default())
        .unwrap_or_default()
}

// `NewChange` is re-exported for callers assembling changes outside of a
// `TableHandler` (e.g. the relay's local-commit path).
pub use commitlog::RowOp;
pub type Change = NewChange;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use commitlog::InMemoryCommitLog;
    use handlers::InMemoryTableHandler;
    use scope::ScopeMap;

    use super::*;

    fn registry_with_tasks() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let handler = Arc::new(InMemoryTableHandler::new(
            "tasks",
            vec!["user_id:{userId}".to_string()],
            vec![],
            |row: &Value| {
                let mut scopes = ScopeMap::new();
                let user_id = row
                    .get("user_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                scopes.insert("user_id".to_string(), scope::ScopeValue::single(user_id));
                Ok(scopes)
            },
            |ctx: &OperationContext| {
                let mut scopes = ScopeMap::new();
                let user_id = ctx
                    .auth
                    .get("user_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                scopes.insert("user_id".to_string(), scope::ScopeValue::single(user_id));
                Ok(scopes)
            },
        ));
        registry.register(handler).unwrap();
        registry
    }

    fn upsert_request(client_commit_id: &str, row_id: &str, user_id: &str) -> PushRequest {
        PushRequest {
            client_id: "c1".to_string(),
            client_commit_id: client_commit_id.to_string(),
            operations: vec![Operation {
                table: "tasks".to_string(),
                row_id: row_id.to_string(),
                op: commitlog::RowOp::Upsert,
                payload: Some(serde_json::json!({"title": "hello", "user_id": user_id})),
                base_version: None,
            }],
            meta: None,
        }
    }

    #[tokio::test]
    async fn applies_then_replays_as_cached() {
        let store = InMemoryCommitLog::new();
        let registry = registry_with_tasks();
        let partition = PartitionId::default_partition();
        let auth = serde_json::json!({"user_id": "u1"});

        let first = push_commit(
            &store,
            &registry,
            &partition,
            "u1",
            auth.clone(),
            upsert_request("k1", "t1", "u1"),
            DEFAULT_MAX_OPERATIONS,
        )
        .await
        .unwrap();
        assert_eq!(first.response.status, PushStatus::Applied);
        assert_eq!(first.response.commit_seq, Some(CommitSeq(1)));

        let second = push_commit(
            &store,
            &registry,
            &partition,
            "u1",
            auth,
            upsert_request("k1", "t1", "u1"),
            DEFAULT_MAX_OPERATIONS,
        )
        .await
        .unwrap();
        assert_eq!(second.response.status, PushStatus::Cached);
        assert_eq!(second.response.commit_seq, Some(CommitSeq(1)));
    }

    #[tokio::test]
    async fn rejects_unauthorized_scope() {
        let store = InMemoryCommitLog::new();
        let registry = registry_with_tasks();
        let partition = PartitionId::default_partition();
        let auth = serde_json::json!({"user_id": "u2"});

        let outcome = push_commit(
            &store,
            &registry,
            &partition,
            "u2",
            auth,
            upsert_request("k1", "t1", "u1"),
            DEFAULT_MAX_OPERATIONS,
        )
        .await
        .unwrap();

        assert_eq!(outcome.response.status, PushStatus::Rejected);
        assert!(matches!(
            outcome.response.results[0],
            OpResult::Error {
                code: SyncErrorCode::UnauthorizedScope,
                ..
            }
        ));
        assert_eq!(store.read_max_commit_seq(&partition).await.unwrap(), CommitSeq::NONE);
    }

    #[tokio::test]
    async fn rejects_oversized_batch() {
        let store = InMemoryCommitLog::new();
        let registry = registry_with_tasks();
        let partition = PartitionId::default_partition();
        let mut request = upsert_request("k1", "t1", "u1");
        request.operations = (0..3)
            .map(|i| Operation {
                row_id: format!("t{i}"),
                ..request.operations[0].clone()
            })
            .collect();

        let err = push_commit(
            &store,
            &registry,
            &partition,
            "u1",
            serde_json::json!({"user_id": "u1"}),
            request,
            2,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }
}
