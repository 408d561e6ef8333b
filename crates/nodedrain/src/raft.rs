//! Log applier contract and a store-backed implementation.
//!
//! The drainer never writes state itself. It submits requests to a
//! [`RaftApplier`] and learns about their effect through the state store,
//! exactly like any other consumer of the replicated log.

use std::collections::HashMap;

use async_trait::async_trait;
use nodedrain_state::{AllocId, DesiredTransition, Evaluation, NodeEvent, NodeId, StateStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DrainError, DrainResult};

/// Submits drainer writes to the replicated log and returns the index at
/// which each was committed.
#[async_trait]
pub trait RaftApplier: Send + Sync + 'static {
    /// Merge `transitions` into the named allocations and create `evals`,
    /// atomically.
    async fn alloc_update_desired_transition(
        &self,
        transitions: HashMap<AllocId, DesiredTransition>,
        evals: Vec<Evaluation>,
    ) -> DrainResult<u64>;

    /// Clear the node's drain strategy and record `event` on it.
    async fn node_drain_complete(&self, node_id: &str, event: NodeEvent) -> DrainResult<u64>;
}

/// Log entry payload produced by the drainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Mark allocations for migration and enqueue one evaluation per job.
    AllocUpdateDesiredTransition {
        transitions: HashMap<AllocId, DesiredTransition>,
        evals: Vec<Evaluation>,
    },
    /// Finish a node's drain.
    NodeDrainComplete { node_id: NodeId, event: NodeEvent },
}

impl Request {
    /// Number of ids the entry carries; bounded by `max_ids_per_txn`.
    pub fn id_count(&self) -> usize {
        match self {
            Request::AllocUpdateDesiredTransition { transitions, evals } => {
                transitions.len() + evals.len()
            }
            Request::NodeDrainComplete { .. } => 1,
        }
    }
}

/// Applies requests directly to a local [`StateStore`], the way the raft
/// state machine applies committed entries.
#[derive(Clone)]
pub struct StoreApplier {
    store: StateStore,
}

impl StoreApplier {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Encode `req` as a log entry and apply it.
    fn submit(&self, req: &Request) -> DrainResult<u64> {
        let entry = serde_json::to_vec(req).map_err(|e| DrainError::Apply(e.to_string()))?;
        self.apply_entry(&entry)
    }

    /// Apply a committed log entry.
    pub fn apply_entry(&self, entry: &[u8]) -> DrainResult<u64> {
        let req: Request =
            serde_json::from_slice(entry).map_err(|e| DrainError::Apply(e.to_string()))?;
        self.apply_request(&req)
    }

    /// Apply one request and return its commit index.
    pub fn apply_request(&self, req: &Request) -> DrainResult<u64> {
        let index = match req {
            Request::AllocUpdateDesiredTransition { transitions, evals } => self
                .store
                .update_alloc_desired_transition(transitions, evals)?,
            Request::NodeDrainComplete { node_id, event } => {
                let snap = self.store.snapshot()?;
                let node = snap.node_by_id(node_id)?.ok_or_else(|| {
                    DrainError::Apply(format!("node {node_id} not found"))
                })?;
                if !node.is_draining() {
                    // Already completed (or cancelled by an operator).
                    return Ok(snap.latest_index()?);
                }
                drop(snap);
                self.store
                    .update_node_drain(node_id, None, false, Some(event.clone()))?
            }
        };
        debug!(index, ids = req.id_count(), "applied drainer request");
        Ok(index)
    }
}

#[async_trait]
impl RaftApplier for StoreApplier {
    async fn alloc_update_desired_transition(
        &self,
        transitions: HashMap<AllocId, DesiredTransition>,
        evals: Vec<Evaluation>,
    ) -> DrainResult<u64> {
        self.submit(&Request::AllocUpdateDesiredTransition { transitions, evals })
    }

    async fn node_drain_complete(&self, node_id: &str, event: NodeEvent) -> DrainResult<u64> {
        self.submit(&Request::NodeDrainComplete {
            node_id: node_id.to_string(),
            event,
        })
    }
}
