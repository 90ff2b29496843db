//! Relay server role (spec.md §4.10): the same push pipeline local clients
//! use against any server, wrapped with an atomic enqueue into the forward
//! outbox and sequence map. If that enqueue fails, the local commit is
//! rolled back so the two stores never diverge (property P8, scenario S7).

use commitlog::{
    CommitLogStore,
    PartitionId,
};
use handlers::HandlerRegistry;
use push::{
    PushOutcome,
    PushRequest,
    PushStatus,
};
use serde_json::Value;

use crate::{
    forward_outbox::InMemoryForwardOutbox,
    sequence_map::InMemorySequenceMap,
};

/// `relayPushCommit({partition, auth, request})`, spec.md §4.10 "Server
/// role". Delegates to [`push::push_commit`] and, only when that produces a
/// fresh (`applied`) commit, enqueues one forward-outbox row per table the
/// commit touched.
pub async fn relay_push_commit(
    store: &dyn CommitLogStore,
    forward_outbox: &InMemoryForwardOutbox,
    sequence_map: &InMemorySequenceMap,
    registry: &HandlerRegistry,
    partition: &PartitionId,
    actor_id: &str,
    auth: Value,
    request: PushRequest,
    max_operations: usize,
) -> anyhow::Result<PushOutcome> {
    let client_id = request.client_id.clone();
    let client_commit_id = request.client_commit_id.clone();
    let operations = request.operations.clone();

    let outcome = push::push_commit(
        store,
        registry,
        partition,
        actor_id,
        auth,
        request,
        max_operations,
    )
    .await?;

    if outcome.response.status != PushStatus::Applied {
        return Ok(outcome);
    }
    let Some(commit_seq) = outcome.response.commit_seq else {
        return Ok(outcome);
    };

    if let Err(enqueue_err) =
        forward_outbox.enqueue(commit_seq, &client_id, &client_commit_id, operations)
    {
        tracing::warn!(
            error = %enqueue_err,
            commit_seq = ?commit_seq,
            "forward-outbox enqueue failed, rolling back local commit"
        );
        store.rollback_commit(partition, commit_seq).await?;
        return Err(enqueue_err.context(format!(
            "forward-outbox insert failed for commit {commit_seq:?}, local commit rolled back"
        )));
    }

    for table in &outcome.affected_tables {
        sequence_map.insert_pending(commit_seq, table);
    }

    Ok(outcome)
}
