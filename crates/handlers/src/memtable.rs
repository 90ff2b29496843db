use std::collections::BTreeMap;

use commitlog::{
    NewChange,
    RowOp,
    RowValue,
};
use errors::SyncErrorCode;
use parking_lot::Mutex;
use scope::ScopeMap;

use crate::{
    ApplyOutcome,
    Operation,
    OperationContext,
    SnapshotPage,
    TableHandler,
};

struct StoredRow {
    value: RowValue,
    version: u64,
    scopes: ScopeMap,
}

/// Reference [`TableHandler`]: rows live in a `parking_lot::Mutex`-guarded
/// map keyed by row-id, with a monotonic per-row version used for
/// optimistic-concurrency checks (spec.md §4.5). Used by the scenario
/// tests in `push`, `pull`, `client`, and `relay`, and by the server
/// binary's demo tables. A real deployment would back `TableHandler` with a
/// SQL dialect adapter instead (an external collaborator, spec.md §1).
pub struct InMemoryTableHandler {
    table: String,
    scope_patterns: Vec<String>,
    depends_on: Vec<String>,
    extract_scopes_fn: Box<dyn Fn(&RowValue) -> anyhow::Result<ScopeMap> + Send + Sync>,
    resolve_scopes_fn: Box<dyn Fn(&OperationContext) -> anyhow::Result<ScopeMap> + Send + Sync>,
    rows: Mutex<BTreeMap<String, StoredRow>>,
}

impl InMemoryTableHandler {
    pub fn new(
        table: impl Into<String>,
        scope_patterns: Vec<String>,
        depends_on: Vec<String>,
        extract_scopes_fn: impl Fn(&RowValue) -> anyhow::Result<ScopeMap> + Send + Sync + 'static,
        resolve_scopes_fn: impl Fn(&OperationContext) -> anyhow::Result<ScopeMap> + Send + Sync + 'static,
    ) -> Self {
        Self {
            table: table.into(),
            scope_patterns,
            depends_on,
            extract_scopes_fn: Box::new(extract_scopes_fn),
            resolve_scopes_fn: Box::new(resolve_scopes_fn),
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Test/demo helper: seed a row without going through the push pipeline.
    pub fn seed(&self, row_id: &str, value: RowValue, version: u64, scopes: ScopeMap) {
        self.rows.lock().insert(
            row_id.to_string(),
            StoredRow {
                value,
                version,
                scopes,
            },
        );
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }
}

impl TableHandler for InMemoryTableHandler {
    fn table_name(&self) -> &str {
        &self.table
    }

    fn scope_patterns(&self) -> &[String] {
        &self.scope_patterns
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    fn resolve_scopes(&self, ctx: &OperationContext) -> anyhow::Result<ScopeMap> {
        (self.resolve_scopes_fn)(ctx)
    }

    fn extract_scopes(&self, row: &RowValue) -> anyhow::Result<ScopeMap> {
        (self.extract_scopes_fn)(row)
    }

    fn snapshot(
        &self,
        _ctx: &OperationContext,
        scope: &ScopeMap,
        page_cursor: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<SnapshotPage> {
        let rows = self.rows.lock();
        let matching: Vec<(&String, &StoredRow)> = rows
            .iter()
            .filter(|(_, row)| scope::matches(&row.scopes, scope))
            .collect();

        let start_after = page_cursor.map(|c| c.to_string());
        let mut page_rows = Vec::new();
        let mut next_cursor = None;
        let mut started = start_after.is_none();
        for (row_id, row) in &matching {
            if !started {
                if Some(*row_id) == start_after.as_ref() {
                    started = true;
                }
                continue;
            }
            if page_rows.len() == limit {
                next_cursor = Some((*row_id).clone());
                break;
            }
            let mut value = row.value.clone();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("server_version".to_string(), row.version.into());
            }
            page_rows.push(value);
        }

        Ok(SnapshotPage {
            rows: page_rows,
            next_cursor,
        })
    }

    fn apply_operation(
        &self,
        _ctx: &OperationContext,
        op: &Operation,
        _op_index: usize,
    ) -> anyhow::Result<ApplyOutcome> {
        let mut rows = self.rows.lock();
        match op.op {
            RowOp::Upsert => {
                let Some(payload) = op.payload.clone() else {
                    return Ok(ApplyOutcome::Error {
                        code: SyncErrorCode::ConstraintViolation,
                        message: "upsert requires a payload".to_string(),
                    });
                };
                let current = rows.get(&op.row_id);
                if let Some(base_version) = op.base_version {
                    let current_version = current.map(|r| r.version).unwrap_or(0);
                    if current_version != base_version {
                        return Ok(ApplyOutcome::Conflict {
                            server_version: current_version,
                            server_row: current
                                .map(|r| r.value.clone())
                                .unwrap_or(serde_json::Value::Null),
                            message: "row changed since base_version".to_string(),
                        });
                    }
                }
                let new_version = current.map(|r| r.version + 1).unwrap_or(1);
                let scopes = (self.extract_scopes_fn)(&payload)?;
                rows.insert(
                    op.row_id.clone(),
                    StoredRow {
                        value: payload.clone(),
                        version: new_version,
                        scopes: scopes.clone(),
                    },
                );
                let mut result_row = payload.clone();
                if let Some(obj) = result_row.as_object_mut() {
                    obj.insert("server_version".to_string(), new_version.into());
                }
                Ok(ApplyOutcome::Applied {
                    server_row_version: new_version,
                    emitted_changes: vec![NewChange {
                        table: self.table.clone(),
                        row_id: op.row_id.clone(),
                        op: RowOp::Upsert,
                        row: Some(result_row.clone()),
                        row_version: Some(new_version),
                        scopes,
                    }],
                    result: result_row,
                })
            },
            RowOp::Delete => {
                let current = rows.get(&op.row_id);
                if current.is_none() {
                    if op.base_version.is_some() {
                        return Ok(ApplyOutcome::Error {
                            code: SyncErrorCode::RowMissing,
                            message: format!(
                                "row {} in table {} does not exist",
                                op.row_id, self.table
                            ),
                        });
                    }
                    return Ok(ApplyOutcome::Applied {
                        server_row_version: 0,
                        emitted_changes: vec![],
                        result: serde_json::Value::Null,
                    });
                }
                let current = current.unwrap();
                if let Some(base_version) = op.base_version {
                    if current.version != base_version {
                        return Ok(ApplyOutcome::Conflict {
                            server_version: current.version,
                            server_row: current.value.clone(),
                            message: "row changed since base_version".to_string(),
                        });
                    }
                }
                let scopes = current.scopes.clone();
                let new_version = current.version + 1;
                rows.remove(&op.row_id);
                Ok(ApplyOutcome::Applied {
                    server_row_version: new_version,
                    emitted_changes: vec![NewChange {
                        table: self.table.clone(),
                        row_id: op.row_id.clone(),
                        op: RowOp::Delete,
                        row: None,
                        row_version: Some(new_version),
                        scopes,
                    }],
                    result: serde_json::Value::Null,
                })
            },
        }
    }
}
