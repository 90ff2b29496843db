use axum::{
    routing::{
        get,
        post,
    },
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    realtime_ws,
    routes,
    state::AppState,
};

pub fn make_app(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(routes::sync))
        .route("/sync/snapshot-chunks/:chunk_id", get(routes::snapshot_chunk))
        .route("/sync/realtime", get(realtime_ws::realtime))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
