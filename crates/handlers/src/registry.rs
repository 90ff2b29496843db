use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        VecDeque,
    },
    sync::Arc,
};

use errors::SyncError;

use crate::TableHandler;

/// Registry of per-table handlers with dependency-ordered bootstrap.
/// Cycles are rejected at registration time (spec.md §4.4).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn TableHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, re-validating that the whole dependency graph
    /// (including the new table) is still acyclic.
    pub fn register(&mut self, handler: Arc<dyn TableHandler>) -> anyhow::Result<()> {
        let table = handler.table_name().to_string();
        self.handlers.insert(table, handler);
        // Validate eagerly so registration-order bugs surface immediately
        // rather than at first bootstrap.
        self.topological_order().map(|_| ())
    }

    pub fn get(&self, table: &str) -> Option<Arc<dyn TableHandler>> {
        self.handlers.get(table).cloned()
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Kahn's algorithm over `dependsOn` edges: a table is only emitted once
    /// every table it depends on has already been emitted, so bootstrapping
    /// in this order always serves dependencies before dependents.
    pub fn topological_order(&self) -> anyhow::Result<Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for table in self.handlers.keys() {
            indegree.entry(table.as_str()).or_insert(0);
        }
        for (table, handler) in &self.handlers {
            for dep in handler.depends_on() {
                *indegree.entry(table.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(table.as_str());
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(table, _)| *table)
            .collect();
        let mut order = Vec::new();
        let mut visited: BTreeSet<&str> = BTreeSet::new();

        while let Some(table) = queue.pop_front() {
            if !visited.insert(table) {
                continue;
            }
            order.push(table.to_string());
            if let Some(dependents) = dependents.get(table) {
                for dependent in dependents {
                    let count = indegree.get_mut(dependent).unwrap();
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != self.handlers.len() {
            return Err(SyncError::internal(
                "handler dependency graph contains a cycle",
            )
            .into());
        }
        Ok(order)
    }
}
