//! Structured error metadata shared by every layer of the sync engine.
//!
//! `SyncError` is attached to an `anyhow` error chain via
//! `.context(SyncError::unauthorized_scope(...))` and later recovered with
//! `ErrorMetadataAnyhowExt` at whichever boundary needs to classify the
//! failure (the push engine deciding `retriable`, the HTTP adapter picking a
//! status code, a test asserting on `short_msg`).

use std::borrow::Cow;

use http::StatusCode;
use serde::{
    Deserialize,
    Serialize,
};

/// Closed set of error kinds from spec.md §7 "Error handling design".
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncErrorCode {
    /// Bad JSON, bad scope shape, oversize batch. 400-class.
    InvalidRequest,
    /// Missing or invalid auth. 401-class.
    Unauthenticated,
    /// A per-operation scope intersection was empty. Never retriable.
    UnauthorizedScope,
    /// Optimistic-concurrency failure; carries `server_version`/`server_row`
    /// at the call site, not in this type (see `push::OpResult::Conflict`).
    ConflictConcurrency,
    /// `base_version` was given but the row doesn't exist.
    RowMissing,
    /// A handler-level constraint (e.g. not-null) was violated.
    ConstraintViolation,
    /// Store timeout, connection drop: safe to retry.
    Transient,
    /// Pull-time scope validation failure; rejects the whole request.
    InvalidSubscriptionScope,
    /// Catch-all for bugs / unexpected internal failures.
    Internal,
}

impl SyncErrorCode {
    /// Whether a per-op `error{code, retriable}` result should tell the
    /// client it is safe to resend the same commit.
    pub fn is_retriable(self) -> bool {
        matches!(self, SyncErrorCode::Transient)
    }

    pub fn http_status(self) -> StatusCode {
        match self {
            SyncErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            SyncErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            SyncErrorCode::UnauthorizedScope => StatusCode::FORBIDDEN,
            SyncErrorCode::ConflictConcurrency => StatusCode::CONFLICT,
            SyncErrorCode::RowMissing => StatusCode::NOT_FOUND,
            SyncErrorCode::ConstraintViolation => StatusCode::UNPROCESSABLE_ENTITY,
            SyncErrorCode::Transient => StatusCode::SERVICE_UNAVAILABLE,
            SyncErrorCode::InvalidSubscriptionScope => StatusCode::BAD_REQUEST,
            SyncErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Attached to an anyhow error chain via `.context(e /* SyncError */)`.
///
/// `short_msg` is a stable ScreamingCamelCase tag usable in tests and in the
/// per-op `error.code` field of the combined response (spec.md §6). `msg` is
/// the longer developer-facing description.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct SyncError {
    pub code: SyncErrorCode,
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

impl SyncError {
    pub fn new(
        code: SyncErrorCode,
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(SyncErrorCode::InvalidRequest, "InvalidRequest", msg)
    }

    pub fn unauthenticated(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(SyncErrorCode::Unauthenticated, "Unauthenticated", msg)
    }

    pub fn unauthorized_scope(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(SyncErrorCode::UnauthorizedScope, "UnauthorizedScope", msg)
    }

    pub fn row_missing(table: &str, row_id: &str) -> Self {
        Self::new(
            SyncErrorCode::RowMissing,
            "RowMissing",
            format!("row {row_id} in table {table} does not exist"),
        )
    }

    pub fn constraint_violation(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(SyncErrorCode::ConstraintViolation, short_msg, msg)
    }

    pub fn transient(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(SyncErrorCode::Transient, "Transient", msg)
    }

    pub fn invalid_subscription_scope(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            SyncErrorCode::InvalidSubscriptionScope,
            "InvalidSubscriptionScope",
            msg,
        )
    }

    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(SyncErrorCode::Internal, "InternalError", msg)
    }

    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn sync_error_code(&self) -> Option<SyncErrorCode>;
    fn short_msg(&self) -> Option<&str>;
    fn is_retriable(&self) -> bool;
    fn http_status(&self) -> StatusCode;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn sync_error_code(&self) -> Option<SyncErrorCode> {
        self.downcast_ref::<SyncError>().map(|e| e.code)
    }

    fn short_msg(&self) -> Option<&str> {
        self.downcast_ref::<SyncError>().map(|e| e.short_msg.as_ref())
    }

    fn is_retriable(&self) -> bool {
        self.downcast_ref::<SyncError>()
            .map(|e| e.is_retriable())
            .unwrap_or(false)
    }

    fn http_status(&self) -> StatusCode {
        self.downcast_ref::<SyncError>()
            .map(|e| e.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}
