//! HTTP error adapter, grounded on this workspace's `HttpResponseError`:
//! any handler can return `anyhow::Result<T>` and have the error classified
//! into a status code and short code via [`errors::ErrorMetadataAnyhowExt`].

use axum::{
    response::{
        IntoResponse,
        Response,
    },
    Json,
};
use errors::ErrorMetadataAnyhowExt;
use serde::Serialize;

pub struct HttpResponseError(anyhow::Error);

impl From<anyhow::Error> for HttpResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    code: String,
    message: String,
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        let code = self.0.short_msg().unwrap_or("InternalError").to_string();
        tracing::warn!(error = %self.0, code = %code, "sync request failed");
        let body = ErrorBody {
            ok: false,
            code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
