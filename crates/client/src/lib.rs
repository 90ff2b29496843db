//! Client outbox, sync loop, and subscription-apply surface (spec.md §4.7
//! and §4.8, components C7 and C8).

mod outbox;
mod table;
mod transport;

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use chrono::{
    Duration,
    Utc,
};
use commitlog::CommitSeq;
pub use outbox::{
    ClientOutbox,
    InMemoryClientOutbox,
    OutboxEntry,
    OutboxStatus,
};
use scope::ScopeMap;
use serde_json::Value;
pub use table::{
    ClientTableHandler,
    InMemoryClientTableHandler,
};
pub use transport::{
    CombinedRequest,
    CombinedResponse,
    LocalTransport,
    SyncTransport,
};

#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub id: String,
    pub table: String,
    pub scopes: ScopeMap,
    pub cursor: CommitSeq,
    pub bootstrap_state: Option<Value>,
}

impl SubscriptionState {
    pub fn new(id: impl Into<String>, table: impl Into<String>, scopes: ScopeMap) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            scopes,
            cursor: CommitSeq(-1),
            bootstrap_state: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOnceOptions {
    pub client_id: String,
    pub stale_timeout: Duration,
    pub max_push_commits: usize,
    pub max_pull_rounds: usize,
    pub pull_options: pull::PullOptions,
}

impl Default for SyncOnceOptions {
    fn default() -> Self {
        Self {
            client_id: "client".to_string(),
            stale_timeout: Duration::milliseconds(30_000),
            max_push_commits: 50,
            max_pull_rounds: 10,
            pull_options: pull::PullOptions::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncOnceResult {
    pub pushed_commits: usize,
    pub pull_rounds: usize,
}

/// `syncOnce(transport, handlers, options)`: drains at most one outbox entry
/// per round and folds each pull response back through the client table
/// handlers, looping until the outbox is drained (or `maxPushCommits` is
/// reached) and bootstrap has caught up (or `maxPullRounds` is reached).
pub async fn sync_once(
    transport: &dyn SyncTransport,
    outbox: &dyn ClientOutbox,
    table_handlers: &BTreeMap<String, Arc<dyn ClientTableHandler>>,
    subscriptions: &parking_lot::Mutex<Vec<SubscriptionState>>,
    options: &SyncOnceOptions,
) -> anyhow::Result<SyncOnceResult> {
    let mut result = SyncOnceResult::default();

    loop {
        let claimed = outbox
            .get_next_sendable(options.stale_timeout, Utc::now())
            .await?;

        let push_request = claimed.as_ref().map(|entry| push::PushRequest {
            client_id: options.client_id.clone(),
            client_commit_id: entry.client_commit_id.clone(),
            operations: entry.operations.clone(),
            meta: None,
        });

        let pull_request = {
            let subs = subscriptions.lock();
            pull::PullRequest {
                subscriptions: subs
                    .iter()
                    .map(|s| pull::SubscriptionRequest {
                        id: s.id.clone(),
                        table: s.table.clone(),
                        scopes: s.scopes.clone(),
                        cursor: s.cursor.0,
                        bootstrap_state: s.bootstrap_state.clone(),
                    })
                    .collect(),
                options: options.pull_options.clone(),
            }
        };

        let response = transport
            .send(CombinedRequest {
                push: push_request,
                pull: pull_request,
            })
            .await?;

        if let (Some(entry), Some(outcome)) = (&claimed, &response.push) {
            classify_push_result(outbox, entry, outcome).await?;
            result.pushed_commits += 1;
        }

        apply_pull_response(transport, table_handlers, subscriptions, &response.pull).await?;
        result.pull_rounds += 1;

        let outbox_drained = outbox.pending_count().await? == 0;
        let bootstrap_caught_up = response
            .pull
            .subscriptions
            .iter()
            .all(|s| s.bootstrap_state.is_none());

        if (outbox_drained || result.pushed_commits >= options.max_push_commits)
            && (bootstrap_caught_up || result.pull_rounds >= options.max_pull_rounds)
        {
            break;
        }
    }

    Ok(result)
}

async fn classify_push_result(
    outbox: &dyn ClientOutbox,
    entry: &OutboxEntry,
    outcome: &push::PushOutcome,
) -> anyhow::Result<()> {
    match outcome.response.status {
        push::PushStatus::Applied | push::PushStatus::Cached => {
            let commit_seq = outcome.response.commit_seq.unwrap_or(CommitSeq::NONE);
            outbox.mark_acked(&entry.id, commit_seq, None).await?;
        },
        push::PushStatus::Rejected => {
            let any_non_retriable = outcome.response.results.iter().any(|r| match r {
                push::OpResult::Conflict { .. } => true,
                push::OpResult::Error { retriable, .. } => !retriable,
                push::OpResult::Applied { .. } => false,
            });
            if any_non_retriable {
                outbox
                    .mark_failed(&entry.id, "non-retriable rejection".to_string(), None)
                    .await?;
            } else {
                outbox
                    .mark_pending(&entry.id, Some("transient rejection, will retry".to_string()))
                    .await?;
            }
        },
    }
    Ok(())
}

async fn apply_pull_response(
    transport: &dyn SyncTransport,
    table_handlers: &BTreeMap<String, Arc<dyn ClientTableHandler>>,
    subscriptions: &parking_lot::Mutex<Vec<SubscriptionState>>,
    pull_response: &pull::PullOutcome,
) -> anyhow::Result<()> {
    for sub_result in &pull_response.subscriptions {
        let table = {
            let subs = subscriptions.lock();
            subs.iter().find(|s| s.id == sub_result.id).map(|s| s.table.clone())
        };
        let Some(table) = table else { continue };
        let Some(handler) = table_handlers.get(&table) else {
            tracing::warn!(table = %table, "no client table handler registered, skipping");
            continue;
        };

        if sub_result.status == pull::SubscriptionStatus::Revoked {
            let previous_scope = {
                let subs = subscriptions.lock();
                subs.iter().find(|s| s.id == sub_result.id).map(|s| s.scopes.clone())
            };
            if let Some(scope) = previous_scope {
                handler.clear_all(&scope)?;
            }
            let mut subs = subscriptions.lock();
            if let Some(state) = subs.iter_mut().find(|s| s.id == sub_result.id) {
                state.scopes = ScopeMap::new();
            }
            continue;
        }

        let apply_result = apply_active_subscription(transport, handler.as_ref(), sub_result).await;

        match apply_result {
            Ok(()) => {
                let mut subs = subscriptions.lock();
                if let Some(state) = subs.iter_mut().find(|s| s.id == sub_result.id) {
                    state.scopes = sub_result.scopes.clone();
                    state.bootstrap_state = sub_result.bootstrap_state.clone();
                    state.cursor = sub_result.next_cursor;
                }
            },
            Err(err) => {
                tracing::warn!(subscription = %sub_result.id, error = %err, "failed to apply pull response, cursor not advanced");
            },
        }
    }
    Ok(())
}

async fn apply_active_subscription(
    transport: &dyn SyncTransport,
    handler: &dyn ClientTableHandler,
    sub_result: &pull::SubscriptionResult,
) -> anyhow::Result<()> {
    if sub_result.bootstrap {
        for page in &sub_result.snapshots {
            if page.is_first_page {
                handler.on_snapshot_start(&sub_result.scopes)?;
            }
            for chunk in &page.chunks {
                let bytes = transport.fetch_chunk(&chunk.id).await?;
                let rows = snapshot::decode_row_frames(&bytes)?;
                handler.apply_snapshot(&rows)?;
            }
        }
    } else {
        for commit in &sub_result.commits {
            for change in &commit.changes {
                handler.apply_change(&change.row_id, change.op, change.row.as_ref())?;
            }
        }
    }
    Ok(())
}
