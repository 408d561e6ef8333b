//! StateSnapshot: a point-in-time, read-only view of the state store.
//!
//! A snapshot wraps one redb read transaction, so every lookup made through
//! it observes the same committed state regardless of concurrent writes.

use redb::{ReadTransaction, ReadableTable};
use serde::de::DeserializeOwned;

use crate::error::{map_err, StateResult};
use crate::tables::*;
use crate::types::*;

/// Consistent read view handed to blocking-query functions and watchers.
pub struct StateSnapshot {
    txn: ReadTransaction,
}

impl StateSnapshot {
    pub(crate) fn new(txn: ReadTransaction) -> Self {
        Self { txn }
    }

    // ── Indexes ────────────────────────────────────────────────────

    /// Index of the last write that touched `table` (0 if never written).
    pub fn index(&self, table: Table) -> StateResult<u64> {
        self.read_index(table.name())
    }

    /// Index of the last write to any table.
    pub fn latest_index(&self) -> StateResult<u64> {
        self.read_index(LATEST_INDEX_KEY)
    }

    fn read_index(&self, key: &str) -> StateResult<u64> {
        let table = self.txn.open_table(INDEXES).map_err(map_err!(Table))?;
        let index = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(index)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Get a node by ID.
    pub fn node_by_id(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        self.get(NODES, node_id)
    }

    /// List all nodes, ordered by ID.
    pub fn nodes(&self) -> StateResult<Vec<NodeInfo>> {
        self.scan(NODES, |_: &NodeInfo| true)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Get a job by namespace and ID.
    pub fn job_by_id(&self, namespace: &str, job_id: &str) -> StateResult<Option<Job>> {
        self.get(JOBS, &NamespacedId::new(namespace, job_id).table_key())
    }

    /// List all jobs.
    pub fn jobs(&self) -> StateResult<Vec<Job>> {
        self.scan(JOBS, |_: &Job| true)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Get an allocation by ID.
    pub fn alloc_by_id(&self, alloc_id: &str) -> StateResult<Option<Allocation>> {
        self.get(ALLOCS, alloc_id)
    }

    /// List the allocations of a job, ordered by allocation ID.
    ///
    /// Terminal allocations are only returned when `include_terminal` is set.
    pub fn allocs_by_job(
        &self,
        namespace: &str,
        job_id: &str,
        include_terminal: bool,
    ) -> StateResult<Vec<Allocation>> {
        self.scan(ALLOCS, |alloc: &Allocation| {
            alloc.namespace == namespace
                && alloc.job_id == job_id
                && (include_terminal || !alloc.is_terminal())
        })
    }

    /// List every allocation placed on a node, terminal ones included.
    pub fn allocs_by_node(&self, node_id: &str) -> StateResult<Vec<Allocation>> {
        self.scan(ALLOCS, |alloc: &Allocation| alloc.node_id == node_id)
    }

    /// List all allocations.
    pub fn allocs(&self) -> StateResult<Vec<Allocation>> {
        self.scan(ALLOCS, |_: &Allocation| true)
    }

    // ── Evaluations ────────────────────────────────────────────────

    /// Get an evaluation by ID.
    pub fn eval_by_id(&self, eval_id: &str) -> StateResult<Option<Evaluation>> {
        self.get(EVALS, eval_id)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, def: RecordTable, key: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan<T, F>(&self, def: RecordTable, mut keep: F) -> StateResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T = decode(value.value())?;
            if keep(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }
}
