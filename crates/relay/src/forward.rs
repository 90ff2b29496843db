//! Forward engine (spec.md §4.10): drains the forward outbox upstream,
//! preserving each entry's original `(clientId, clientCommitId)` so
//! upstream's own idempotency check deduplicates retries (property P7).

use chrono::{
    Duration as ChronoDuration,
    Utc,
};
use client::{
    CombinedRequest,
    SyncTransport,
};
use pull::PullRequest;
use push::{
    PushRequest,
    PushStatus,
};

use crate::{
    forward_outbox::{
        ForwardOutboxEntry,
        InMemoryForwardOutbox,
    },
    sequence_map::InMemorySequenceMap,
};

#[derive(Debug, Clone)]
pub enum ForwardOutcome {
    Forwarded { entry_id: String, upstream_commit_seq: commitlog::CommitSeq },
    Conflict { entry_id: String, message: String },
    Idle,
}

/// Claims and forwards a single entry; callers drive this from a periodic
/// timer at the configured forward interval (spec.md §6).
pub async fn forward_once(
    transport: &dyn SyncTransport,
    outbox: &InMemoryForwardOutbox,
    sequence_map: &InMemorySequenceMap,
    stale_after: ChronoDuration,
) -> anyhow::Result<ForwardOutcome> {
    let now = Utc::now();
    let Some(entry) = outbox.claim_next(now, stale_after) else {
        return Ok(ForwardOutcome::Idle);
    };

    let response = transport
        .send(CombinedRequest {
            push: Some(to_push_request(&entry)),
            pull: PullRequest::default(),
        })
        .await?;

    let Some(push_outcome) = response.push else {
        anyhow::bail!("upstream returned no push outcome for a forwarded commit");
    };

    match push_outcome.response.status {
        PushStatus::Applied | PushStatus::Cached => {
            let Some(upstream_commit_seq) = push_outcome.response.commit_seq else {
                anyhow::bail!("upstream applied a commit without a commit-seq");
            };
            outbox.mark_forwarded(&entry.id, upstream_commit_seq);
            sequence_map.mark_forwarded(entry.local_commit_seq, upstream_commit_seq);
            Ok(ForwardOutcome::Forwarded {
                entry_id: entry.id,
                upstream_commit_seq,
            })
        },
        PushStatus::Rejected => {
            let message = push_outcome
                .response
                .results
                .iter()
                .find_map(|r| match r {
                    push::OpResult::Conflict { message, .. } => Some(message.clone()),
                    push::OpResult::Error { message, .. } => Some(message.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "upstream rejected the forwarded commit".to_string());
            tracing::warn!(entry_id = %entry.id, %message, "forwardConflict");
            outbox.mark_failed(&entry.id, message.clone());
            Ok(ForwardOutcome::Conflict {
                entry_id: entry.id,
                message,
            })
        },
    }
}

fn to_push_request(entry: &ForwardOutboxEntry) -> PushRequest {
    PushRequest {
        client_id: entry.client_id.clone(),
        client_commit_id: entry.client_commit_id.clone(),
        operations: entry.operations.clone(),
        meta: None,
    }
}
