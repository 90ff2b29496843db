use std::collections::BTreeMap;

use commitlog::RowValue;
use parking_lot::Mutex;
use scope::ScopeMap;

/// Per-table apply surface on the client (spec.md §4.8, component C8). All
/// four methods run inside the caller's atomic unit (one local transaction
/// per `syncOnce` pull application) and must be idempotent, since a replayed
/// commit or a re-bootstrapped scope can call them more than once with the
/// same inputs.
pub trait ClientTableHandler: Send + Sync {
    /// Deletes all locally-held rows in `scope` ahead of a fresh bootstrap
    /// page for that scope.
    fn on_snapshot_start(&self, scope: &ScopeMap) -> anyhow::Result<()>;

    /// Bulk-upserts a bootstrap page's rows by primary key.
    fn apply_snapshot(&self, rows: &[RowValue]) -> anyhow::Result<()>;

    /// Upserts on `op = upsert`, deletes by row-id on `op = delete`.
    fn apply_change(&self, row_id: &str, op: commitlog::RowOp, row: Option<&RowValue>) -> anyhow::Result<()>;

    /// Scope-bounded purge used when a subscription is revoked.
    fn clear_all(&self, scope: &ScopeMap) -> anyhow::Result<()>;
}

/// Reference [`ClientTableHandler`] storing rows in a local map keyed by
/// primary key, with a `row_id -> scope` shadow table so `clear_all` can be
/// scope-bounded. A real client would back this with the on-device
/// database (SQLite, IndexedDB); this is what it would need to implement.
pub struct InMemoryClientTableHandler {
    scope_of_row: fn(&RowValue) -> ScopeMap,
    rows: Mutex<BTreeMap<String, (RowValue, ScopeMap)>>,
}

impl InMemoryClientTableHandler {
    pub fn new(scope_of_row: fn(&RowValue) -> ScopeMap) -> Self {
        Self {
            scope_of_row,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn get(&self, row_id: &str) -> Option<RowValue> {
        self.rows.lock().get(row_id).map(|(row, _)| row.clone())
    }

    fn primary_key(row: &RowValue) -> Option<String> {
        row.get("id")
            .or_else(|| row.get("row_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

impl ClientTableHandler for InMemoryClientTableHandler {
    fn on_snapshot_start(&self, scope: &ScopeMap) -> anyhow::Result<()> {
        self.clear_all(scope)
    }

    fn apply_snapshot(&self, rows: &[RowValue]) -> anyhow::Result<()> {
        let mut stored = self.rows.lock();
        for row in rows {
            let Some(pk) = Self::primary_key(row) else {
                continue;
            };
            let scope = (self.scope_of_row)(row);
            stored.insert(pk, (row.clone(), scope));
        }
        Ok(())
    }

    fn apply_change(&self, row_id: &str, op: commitlog::RowOp, row: Option<&RowValue>) -> anyhow::Result<()> {
        let mut stored = self.rows.lock();
        match op {
            commitlog::RowOp::Upsert => {
                let Some(row) = row else {
                    return Ok(());
                };
                let scope = (self.scope_of_row)(row);
                stored.insert(row_id.to_string(), (row.clone(), scope));
            },
            commitlog::RowOp::Delete => {
                stored.remove(row_id);
            },
        }
        Ok(())
    }

    fn clear_all(&self, scope: &ScopeMap) -> anyhow::Result<()> {
        let mut stored = self.rows.lock();
        stored.retain(|_, (_, row_scope)| !scope::matches(row_scope, scope));
        Ok(())
    }
}
