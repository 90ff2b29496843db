//! HTTP handlers for the combined `/sync` surface (spec.md §6), grounded on
//! this workspace's `public_api` handler idiom: `State<AppState>` extractor,
//! `Json<T>` bodies, `Result<impl IntoResponse, HttpResponseError>` returns.

use axum::{
    body::Bytes,
    extract::{
        Path,
        State,
    },
    http::{
        header,
        HeaderMap,
        StatusCode,
    },
    response::IntoResponse,
    Json,
};
use serde_json::Value;

use crate::{
    error::HttpResponseError,
    state::AppState,
    wire::{
        pull_request_from_wire,
        push_request_from_wire,
        PullResponseWire,
        PushResponseWire,
        SyncRequestWire,
        SyncResponseWire,
    },
};

/// Authentication is an external collaborator (spec.md §1); this adapter's
/// stand-in reads the caller's identity from a header instead of verifying a
/// real credential. A production deployment would replace this extractor
/// with one backed by whatever auth system fronts the service.
fn actor_from_headers(headers: &HeaderMap) -> (String, Value) {
    let actor_id = headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    let auth = headers
        .get("x-actor-auth")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null);
    (actor_id, auth)
}

pub async fn sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SyncRequestWire>,
) -> Result<impl IntoResponse, HttpResponseError> {
    let (actor_id, auth) = actor_from_headers(&headers);
    let store = state.store_as_trait();

    let push = match req.push {
        Some(push_wire) => {
            if push_wire.operations.len() > state.config.max_operations_per_push {
                return Err(anyhow::anyhow!("too many operations in a single push").into());
            }
            let request = push_request_from_wire(req.client_id.clone(), push_wire);
            let outcome = push::push_commit(
                store,
                &state.registry,
                &state.partition,
                &actor_id,
                auth.clone(),
                request,
                state.config.max_operations_per_push,
            )
            .await?;
            Some(PushResponseWire::from(outcome))
        },
        None => None,
    };

    let pull_wire = req.pull;
    let subscription_count = pull_wire.as_ref().map(|p| p.subscriptions.len()).unwrap_or(0);
    if subscription_count > state.config.max_subscriptions_per_pull {
        return Err(anyhow::anyhow!("too many subscriptions in a single pull").into());
    }
    let pull_request = pull_request_from_wire(pull_wire, &state.config);
    let outcome = pull::pull(store, state.chunks.as_ref(), &state.registry, &state.partition, &actor_id, auth, pull_request).await?;

    let scope_keys: Vec<String> = outcome
        .subscriptions
        .iter()
        .map(|sub| scope::scope_key(&sub.scopes))
        .collect();
    state.realtime.update_client_scope_keys(&req.client_id, scope_keys);

    let pull = PullResponseWire::from(outcome);

    Ok(Json(SyncResponseWire { push, pull }))
}

pub async fn snapshot_chunk(
    State(state): State<AppState>,
    Path(chunk_id): Path<String>,
) -> Result<impl IntoResponse, HttpResponseError> {
    let body = state
        .chunks
        .read_chunk(&chunk_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("unknown snapshot chunk"))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/octet-stream".parse().unwrap());
    headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
    Ok((StatusCode::OK, headers, Bytes::from(body.compressed_bytes)))
}
