//! JSON wire format for the combined `/sync` endpoint (spec.md §6).
//!
//! Top-level fields are camelCase; `operations[]` items keep the
//! spec's literal snake_case member names (`row_id`, `base_version`) since
//! that's what spec.md §6's request grammar spells out.

use commitlog::{
    RowOp,
    RowValue,
};
use scope::ScopeMap;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestWire {
    pub client_id: String,
    pub push: Option<PushRequestWire>,
    #[serde(default)]
    pub pull: Option<PullRequestWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequestWire {
    pub client_commit_id: String,
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub operations: Vec<OperationWire>,
}

#[derive(Debug, Deserialize)]
pub struct OperationWire {
    pub table: String,
    pub row_id: String,
    pub op: RowOp,
    #[serde(default)]
    pub payload: Option<RowValue>,
    #[serde(default)]
    pub base_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestWire {
    #[serde(default)]
    pub limit_commits: Option<f64>,
    #[serde(default)]
    pub limit_snapshot_rows: Option<f64>,
    #[serde(default)]
    pub max_snapshot_pages: Option<f64>,
    #[serde(default)]
    pub dedupe_rows: bool,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRequestWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequestWire {
    pub id: String,
    pub table: String,
    #[serde(default)]
    pub scopes: ScopeMap,
    /// Reserved for handler-specific per-subscription parameters; not
    /// consumed by any handler in this workspace today.
    #[serde(default)]
    pub params: Option<Value>,
    pub cursor: i64,
    #[serde(default)]
    pub bootstrap_state: Option<Value>,
}

impl From<SubscriptionRequestWire> for pull::SubscriptionRequest {
    fn from(wire: SubscriptionRequestWire) -> Self {
        pull::SubscriptionRequest {
            id: wire.id,
            table: wire.table,
            scopes: wire.scopes,
            cursor: wire.cursor,
            bootstrap_state: wire.bootstrap_state,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseWire {
    pub push: Option<PushResponseWire>,
    pub pull: PullResponseWire,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponseWire {
    pub ok: bool,
    pub status: &'static str,
    pub commit_seq: Option<i64>,
    pub results: Vec<Value>,
}

impl From<push::PushOutcome> for PushResponseWire {
    fn from(outcome: push::PushOutcome) -> Self {
        let status = match outcome.response.status {
            push::PushStatus::Applied => "applied",
            push::PushStatus::Cached => "cached",
            push::PushStatus::Rejected => "rejected",
        };
        PushResponseWire {
            ok: true,
            status,
            commit_seq: outcome.response.commit_seq.map(|s| s.0),
            results: outcome.response.results.iter().map(op_result_to_wire).collect(),
        }
    }
}

fn op_result_to_wire(result: &push::OpResult) -> Value {
    match result {
        push::OpResult::Applied { op_index, result } => serde_json::json!({
            "opIndex": op_index,
            "status": "applied",
            "result": result,
        }),
        push::OpResult::Conflict {
            op_index,
            server_version,
            server_row,
            message,
        } => serde_json::json!({
            "opIndex": op_index,
            "status": "conflict",
            "serverVersion": server_version,
            "serverRow": server_row,
            "message": message,
        }),
        push::OpResult::Error {
            op_index,
            code,
            message,
            retriable,
        } => serde_json::json!({
            "opIndex": op_index,
            "status": "error",
            "code": format!("{code:?}"),
            "message": message,
            "retriable": retriable,
        }),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponseWire {
    pub ok: bool,
    pub subscriptions: Vec<SubscriptionResultWire>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResultWire {
    pub id: String,
    pub status: &'static str,
    pub scopes: ScopeMap,
    pub bootstrap: bool,
    pub bootstrap_state: Option<Value>,
    pub next_cursor: i64,
    pub commits: Vec<CommitWire>,
    pub snapshots: Vec<SnapshotWire>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitWire {
    pub commit_seq: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub actor_id: String,
    pub changes: Vec<ChangeWire>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeWire {
    pub change_id: i64,
    pub row_id: String,
    pub op: RowOp,
    pub row: Option<RowValue>,
    pub row_version: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWire {
    pub table: String,
    pub is_first_page: bool,
    pub is_last_page: bool,
    pub chunks: Vec<ChunkSummaryWire>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummaryWire {
    pub id: String,
    pub sha256: String,
    pub byte_length: usize,
    pub encoding: String,
    pub compression: String,
}

impl From<pull::PullOutcome> for PullResponseWire {
    fn from(outcome: pull::PullOutcome) -> Self {
        PullResponseWire {
            ok: true,
            subscriptions: outcome.subscriptions.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<pull::SubscriptionResult> for SubscriptionResultWire {
    fn from(sub: pull::SubscriptionResult) -> Self {
        let status = match sub.status {
            pull::SubscriptionStatus::Active => "active",
            pull::SubscriptionStatus::Revoked => "revoked",
        };
        SubscriptionResultWire {
            id: sub.id,
            status,
            scopes: sub.scopes,
            bootstrap: sub.bootstrap,
            bootstrap_state: sub.bootstrap_state,
            next_cursor: sub.next_cursor.0,
            commits: sub.commits.into_iter().map(Into::into).collect(),
            snapshots: sub.snapshots.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<pull::CommitPayload> for CommitWire {
    fn from(commit: pull::CommitPayload) -> Self {
        CommitWire {
            commit_seq: commit.commit_seq.0,
            created_at: commit.created_at,
            actor_id: commit.actor_id,
            changes: commit.changes.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<pull::ChangePayload> for ChangeWire {
    fn from(change: pull::ChangePayload) -> Self {
        ChangeWire {
            change_id: change.change_id,
            row_id: change.row_id,
            op: change.op,
            row: change.row,
            row_version: change.row_version,
        }
    }
}

impl From<pull::SnapshotPayload> for SnapshotWire {
    fn from(snapshot: pull::SnapshotPayload) -> Self {
        SnapshotWire {
            table: snapshot.table,
            is_first_page: snapshot.is_first_page,
            is_last_page: snapshot.is_last_page,
            chunks: snapshot.chunks.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<pull::ChunkSummary> for ChunkSummaryWire {
    fn from(chunk: pull::ChunkSummary) -> Self {
        ChunkSummaryWire {
            id: chunk.id,
            sha256: chunk.sha256,
            byte_length: chunk.byte_length,
            encoding: chunk.encoding,
            compression: chunk.compression,
        }
    }
}

pub fn pull_request_from_wire(wire: Option<PullRequestWire>, config: &crate::config::SyncConfig) -> pull::PullRequest {
    let Some(wire) = wire else {
        return pull::PullRequest::default();
    };
    let options = pull::PullOptions {
        limit_commits: pull::clamp_limit(wire.limit_commits, pull::DEFAULT_LIMIT_COMMITS, config.max_pull_limit_commits),
        limit_snapshot_rows: pull::clamp_limit(
            wire.limit_snapshot_rows,
            pull::DEFAULT_LIMIT_SNAPSHOT_ROWS,
            pull::MAX_LIMIT_SNAPSHOT_ROWS,
        ),
        max_snapshot_pages: pull::clamp_limit(
            wire.max_snapshot_pages,
            pull::DEFAULT_MAX_SNAPSHOT_PAGES,
            pull::MAX_MAX_SNAPSHOT_PAGES,
        ),
        dedupe_rows: wire.dedupe_rows,
    };
    pull::PullRequest {
        subscriptions: wire.subscriptions.into_iter().map(Into::into).collect(),
        options,
    }
}

impl From<OperationWire> for handlers::Operation {
    fn from(wire: OperationWire) -> Self {
        handlers::Operation {
            table: wire.table,
            row_id: wire.row_id,
            op: wire.op,
            payload: wire.payload,
            base_version: wire.base_version,
        }
    }
}

pub fn push_request_from_wire(client_id: String, wire: PushRequestWire) -> push::PushRequest {
    push::PushRequest {
        client_id,
        client_commit_id: wire.client_commit_id,
        operations: wire.operations.into_iter().map(Into::into).collect(),
        meta: None,
    }
}
