//! `GET /sync/realtime` websocket (spec.md §4.9, §6), grounded on this
//! workspace's reactive websocket handler idiom (`WebSocketUpgrade` +
//! `mpsc` channel per connection + a heartbeat tick), simplified to plain
//! `axum::extract::ws` rather than the permessage-deflate extension this
//! workspace's HTTP layer otherwise supports — that negotiation is
//! orthogonal to the sync protocol itself.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{
            Message,
            WebSocket,
            WebSocketUpgrade,
        },
        Query,
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{
    SinkExt,
    StreamExt,
};
use realtime::RealtimeEvent;
use tokio::sync::mpsc;

use crate::state::AppState;

pub async fn realtime(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let client_id = params.get("clientId").cloned().unwrap_or_else(|| "anonymous".to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RealtimeEvent>(64);
    let conn_id = state.realtime.register(&client_id, Vec::new(), tx);
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if sink.send(Message::Text(event_to_json(&event).to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                let event = RealtimeEvent::Heartbeat { timestamp: Utc::now() };
                if sink.send(Message::Text(event_to_json(&event).to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.realtime.unregister(conn_id);
}

fn event_to_json(event: &RealtimeEvent) -> serde_json::Value {
    match event {
        RealtimeEvent::Sync { cursor, timestamp } => serde_json::json!({
            "event": "sync",
            "data": { "cursor": cursor, "timestamp": timestamp },
        }),
        RealtimeEvent::Heartbeat { timestamp } => serde_json::json!({
            "event": "heartbeat",
            "data": { "timestamp": timestamp },
        }),
        RealtimeEvent::Error { error, timestamp } => serde_json::json!({
            "event": "error",
            "data": { "message": error, "timestamp": timestamp },
        }),
    }
}
