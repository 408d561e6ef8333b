//! StateStore: redb-backed state persistence for the node drainer.
//!
//! Every write runs in a single redb write transaction that consumes the
//! next raft-style index. The index is stamped on the written records
//! (`modify_index`, and `create_index` for new records), on each touched
//! table, and on the store-wide latest index. After commit the index is
//! published on a watch channel so that blocking queries can re-run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{StateError, StateResult, map_err};
use crate::snapshot::StateSnapshot;
use crate::tables::*;
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    changes: Arc<watch::Sender<u64>>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let db = Arc::new(db);
        Self::ensure_tables(&db)?;
        let latest = {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            StateSnapshot::new(txn).latest_index()?
        };
        let (changes, _) = watch::channel(latest);
        Ok(Self {
            db,
            changes: Arc::new(changes),
        })
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(db: &Database) -> StateResult<()> {
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(ALLOCS).map_err(map_err!(Table))?;
        txn.open_table(EVALS).map_err(map_err!(Table))?;
        txn.open_table(INDEXES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Take a consistent point-in-time view of the store.
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(StateSnapshot::new(txn))
    }

    /// Index of the last committed write.
    pub fn latest_index(&self) -> StateResult<u64> {
        self.snapshot()?.latest_index()
    }

    /// Run `query` against a fresh snapshot until the index it reports
    /// exceeds `min_index`.
    ///
    /// `query` returns its result together with the index that result
    /// reflects. Between attempts the call parks until another write
    /// commits. Cancelling `cancel` ends the wait with
    /// [`StateError::Cancelled`].
    pub async fn blocking_query<T, F>(
        &self,
        min_index: u64,
        cancel: &CancellationToken,
        mut query: F,
    ) -> StateResult<(T, u64)>
    where
        F: FnMut(&StateSnapshot) -> StateResult<(T, u64)>,
    {
        let mut changes = self.changes.subscribe();
        loop {
            // Mark the current value seen before reading so that a commit
            // racing with the query still wakes the wait below.
            changes.borrow_and_update();
            let index = {
                let snapshot = self.snapshot()?;
                let (value, index) = query(&snapshot)?;
                if index > min_index {
                    return Ok((value, index));
                }
                index
            };
            trace!(min_index, index, "blocking query waiting for a newer index");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StateError::Cancelled),
                changed = changes.changed() => {
                    changed.map_err(|_| StateError::Cancelled)?;
                }
            }
        }
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or replace a node record.
    pub fn upsert_node(&self, node: &NodeInfo) -> StateResult<u64> {
        let (_, index) = self.write(&[Table::Nodes], |txn, index| {
            let mut node = node.clone();
            let existing: Option<NodeInfo> = get_record(txn, NODES, &node.id)?;
            node.create_index = existing.map_or(index, |n| n.create_index);
            node.modify_index = index;
            put_record(txn, NODES, &node.id, &node)
        })?;
        debug!(node_id = %node.id, index, "node stored");
        Ok(index)
    }

    /// Set or clear a node's drain strategy.
    ///
    /// Setting a strategy makes the node ineligible for scheduling. When
    /// clearing it, `mark_eligible` restores eligibility. `event`, if any,
    /// is appended to the node's event history.
    pub fn update_node_drain(
        &self,
        node_id: &str,
        strategy: Option<DrainStrategy>,
        mark_eligible: bool,
        event: Option<NodeEvent>,
    ) -> StateResult<u64> {
        let draining = strategy.is_some();
        let (_, index) = self.write(&[Table::Nodes], |txn, index| {
            let mut node: NodeInfo = get_record(txn, NODES, node_id)?
                .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
            if strategy.is_some() {
                node.scheduling_eligibility = SchedulingEligibility::Ineligible;
            } else if mark_eligible {
                node.scheduling_eligibility = SchedulingEligibility::Eligible;
            }
            node.drain_strategy = strategy;
            if let Some(event) = event {
                node.events.push(event);
            }
            node.modify_index = index;
            put_record(txn, NODES, node_id, &node)
        })?;
        debug!(%node_id, draining, index, "node drain updated");
        Ok(index)
    }

    /// Delete a node. Deleting an unknown node still consumes an index.
    pub fn delete_node(&self, node_id: &str) -> StateResult<u64> {
        let (_, index) = self.write(&[Table::Nodes], |txn, _| {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table.remove(node_id).map_err(map_err!(Write))?;
            Ok(())
        })?;
        debug!(%node_id, index, "node deleted");
        Ok(index)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or replace a job.
    pub fn upsert_job(&self, job: &Job) -> StateResult<u64> {
        let key = job.table_key();
        let (_, index) = self.write(&[Table::Jobs], |txn, index| {
            let mut job = job.clone();
            let existing: Option<Job> = get_record(txn, JOBS, &key)?;
            job.create_index = existing.map_or(index, |j| j.create_index);
            job.modify_index = index;
            put_record(txn, JOBS, &key, &job)
        })?;
        debug!(%key, index, "job stored");
        Ok(index)
    }

    /// Purge a job.
    pub fn delete_job(&self, namespace: &str, job_id: &str) -> StateResult<u64> {
        let key = NamespacedId::new(namespace, job_id).table_key();
        let (_, index) = self.write(&[Table::Jobs], |txn, _| {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table.remove(key.as_str()).map_err(map_err!(Write))?;
            Ok(())
        })?;
        debug!(%key, index, "job deleted");
        Ok(index)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or replace a set of allocations in one write.
    pub fn upsert_allocs(&self, allocs: &[Allocation]) -> StateResult<u64> {
        let (_, index) = self.write(&[Table::Allocs], |txn, index| {
            for alloc in allocs {
                let mut alloc = alloc.clone();
                let existing: Option<Allocation> = get_record(txn, ALLOCS, &alloc.id)?;
                alloc.create_index = existing.map_or(index, |a| a.create_index);
                alloc.modify_index = index;
                put_record(txn, ALLOCS, &alloc.id, &alloc)?;
            }
            Ok(())
        })?;
        debug!(count = allocs.len(), index, "allocations stored");
        Ok(index)
    }

    /// Merge desired transitions into existing allocations and insert the
    /// accompanying evaluations, all at one index.
    ///
    /// Transitions naming unknown allocations are skipped.
    pub fn update_alloc_desired_transition(
        &self,
        transitions: &HashMap<AllocId, DesiredTransition>,
        evals: &[Evaluation],
    ) -> StateResult<u64> {
        let (updated, index) = self.write(&[Table::Allocs, Table::Evals], |txn, index| {
            let mut updated = 0usize;
            for (alloc_id, transition) in transitions {
                let Some(mut alloc): Option<Allocation> = get_record(txn, ALLOCS, alloc_id)?
                else {
                    continue;
                };
                alloc.desired_transition.merge(transition);
                alloc.modify_index = index;
                put_record(txn, ALLOCS, alloc_id, &alloc)?;
                updated += 1;
            }
            insert_evals(txn, evals, index)?;
            Ok(updated)
        })?;
        debug!(
            updated,
            requested = transitions.len(),
            evals = evals.len(),
            index,
            "allocation desired transitions updated"
        );
        Ok(index)
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Run `apply` in one write transaction at the next index, then publish
    /// that index to blocking queries.
    fn write<T, F>(&self, touched: &[Table], apply: F) -> StateResult<(T, u64)>
    where
        F: FnOnce(&WriteTransaction, u64) -> StateResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = {
            let mut indexes = txn.open_table(INDEXES).map_err(map_err!(Table))?;
            let latest = indexes
                .get(LATEST_INDEX_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let index = latest + 1;
            indexes
                .insert(LATEST_INDEX_KEY, index)
                .map_err(map_err!(Write))?;
            for table in touched {
                indexes.insert(table.name(), index).map_err(map_err!(Write))?;
            }
            index
        };
        let out = apply(&txn, index)?;
        txn.commit().map_err(map_err!(Transaction))?;
        self.changes.send_replace(index);
        Ok((out, index))
    }
}

fn get_record<T: DeserializeOwned>(
    txn: &WriteTransaction,
    def: RecordTable,
    key: &str,
) -> StateResult<Option<T>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let record = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Some(decode(guard.value())?),
        None => None,
    };
    Ok(record)
}

fn put_record<T: Serialize>(
    txn: &WriteTransaction,
    def: RecordTable,
    key: &str,
    record: &T,
) -> StateResult<()> {
    let value = encode(record)?;
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    table
        .insert(key, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn insert_evals(txn: &WriteTransaction, evals: &[Evaluation], index: u64) -> StateResult<()> {
    for eval in evals {
        let mut eval = eval.clone();
        let existing: Option<Evaluation> = get_record(txn, EVALS, &eval.id)?;
        eval.create_index = existing.map_or(index, |e| e.create_index);
        eval.modify_index = index;
        put_record(txn, EVALS, &eval.id, &eval)?;
    }
    Ok(())
}
