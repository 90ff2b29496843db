//! Per-table handler registry (spec.md §4.4, component C4).
//!
//! Every user table that participates in sync registers a [`TableHandler`]
//! declaring its scope-key vocabulary, its bootstrap dependencies, and the
//! four operations the push/pull engines call into: `resolve_scopes`,
//! `extract_scopes`, `snapshot`, `apply_operation`. [`HandlerRegistry`]
//! topologically sorts the dependency graph once at registration time so
//! the pull engine can bootstrap dependencies before dependents.

mod memtable;
mod registry;

use std::collections::BTreeSet;

use commitlog::{
    NewChange,
    RowOp,
    RowValue,
};
use errors::SyncErrorCode;
use scope::ScopeMap;

pub use crate::{
    memtable::InMemoryTableHandler,
    registry::HandlerRegistry,
};

/// Caller identity and partition passed into every handler call. Deliberately
/// thin: auth token verification is an external collaborator (spec.md §1);
/// by the time a handler sees a context, `auth` already carries whatever
/// claims it needs (actor id, roles, tenant) as an opaque JSON value.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub partition: commitlog::PartitionId,
    pub actor_id: String,
    pub auth: serde_json::Value,
}

/// One operation from the push request's `operations[]` (spec.md §6).
#[derive(Debug, Clone)]
pub struct Operation {
    pub table: String,
    pub row_id: String,
    pub op: RowOp,
    pub payload: Option<RowValue>,
    pub base_version: Option<u64>,
}

/// Result of `applyOperation`, spec.md §4.5's three-way per-op outcome.
pub enum ApplyOutcome {
    Applied {
        server_row_version: u64,
        emitted_changes: Vec<NewChange>,
        result: serde_json::Value,
    },
    Conflict {
        server_version: u64,
        server_row: RowValue,
        message: String,
    },
    Error {
        code: SyncErrorCode,
        message: String,
    },
}

/// One page of a bootstrap snapshot, spec.md §4.4 `snapshot(ctx, pageState)`.
pub struct SnapshotPage {
    pub rows: Vec<RowValue>,
    pub next_cursor: Option<String>,
}

pub trait TableHandler: Send + Sync {
    fn table_name(&self) -> &str;

    /// `prefix:{varName}` strings declaring this table's scope-key
    /// vocabulary (spec.md §4.4).
    fn scope_patterns(&self) -> &[String];

    /// Other tables that must finish bootstrapping before this one.
    fn depends_on(&self) -> &[String];

    /// The `{varName}` set extracted from `scope_patterns`, used to reject
    /// subscription requests that reference an undeclared scope key
    /// (`InvalidSubscriptionScope`, spec.md §4.1).
    fn declared_scope_keys(&self) -> BTreeSet<String> {
        self.scope_patterns()
            .iter()
            .filter_map(|pattern| {
                let start = pattern.find('{')?;
                let end = pattern[start..].find('}')? + start;
                Some(pattern[start + 1..end].to_string())
            })
            .collect()
    }

    fn resolve_scopes(&self, ctx: &OperationContext) -> anyhow::Result<ScopeMap>;

    fn extract_scopes(&self, row: &RowValue) -> anyhow::Result<ScopeMap>;

    fn snapshot(
        &self,
        ctx: &OperationContext,
        scope: &ScopeMap,
        page_cursor: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<SnapshotPage>;

    fn apply_operation(
        &self,
        ctx: &OperationContext,
        op: &Operation,
        op_index: usize,
    ) -> anyhow::Result<ApplyOutcome>;
}
