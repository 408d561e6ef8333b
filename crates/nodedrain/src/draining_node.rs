//! The registry's record of one draining node.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use nodedrain_state::{
    Allocation, DrainStrategy, JobType, NamespacedId, NodeInfo, StateSnapshot, StateStore,
};

use crate::error::{DrainError, DrainResult};

/// Latest observed snapshot of a draining node, plus the queries the main
/// loop asks of it. Each query reads a fresh store snapshot.
pub struct DrainingNode {
    store: StateStore,
    node: RwLock<NodeInfo>,
}

impl DrainingNode {
    pub fn new(node: NodeInfo, store: StateStore) -> Self {
        Self {
            store,
            node: RwLock::new(node),
        }
    }

    pub fn node(&self) -> NodeInfo {
        self.node
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the node snapshot.
    pub fn update(&self, node: NodeInfo) {
        *self.node.write().unwrap_or_else(PoisonError::into_inner) = node;
    }

    fn strategy(&self) -> DrainResult<(String, DrainStrategy)> {
        let node = self.node.read().unwrap_or_else(PoisonError::into_inner);
        match &node.drain_strategy {
            Some(strategy) => Ok((node.id.clone(), strategy.clone())),
            None => Err(DrainError::NoStrategy(node.id.clone())),
        }
    }

    /// The drain deadline; `None` when the node drains without one.
    pub fn deadline(&self) -> DrainResult<Option<SystemTime>> {
        Ok(self.strategy()?.1.deadline)
    }

    /// Whether every allocation on the node is terminal. System allocations
    /// are skipped when the strategy ignores system jobs.
    pub fn is_done(&self) -> DrainResult<bool> {
        let (node_id, strategy) = self.strategy()?;
        let snap = self.store.snapshot()?;
        let allocs = classified_allocs(&snap, &node_id)?;
        Ok(allocs
            .iter()
            .filter(|(_, system)| !(strategy.ignore_system_jobs && *system))
            .all(|(alloc, _)| alloc.is_terminal()))
    }

    /// Allocations to force-migrate once the deadline has fired: every
    /// non-terminal allocation on the node, system ones filtered by the
    /// strategy. Empty for nodes without a deadline.
    pub fn deadline_allocs(&self) -> DrainResult<Vec<Allocation>> {
        let (node_id, strategy) = self.strategy()?;
        if strategy.is_infinite() {
            return Ok(Vec::new());
        }
        let snap = self.store.snapshot()?;
        Ok(classified_allocs(&snap, &node_id)?
            .into_iter()
            .filter(|(alloc, system)| {
                !alloc.is_terminal() && !(strategy.ignore_system_jobs && *system)
            })
            .map(|(alloc, _)| alloc)
            .collect())
    }

    /// Jobs with a non-terminal allocation on the node.
    pub fn draining_jobs(&self) -> DrainResult<Vec<NamespacedId>> {
        let (node_id, _) = self.strategy()?;
        let snap = self.store.snapshot()?;
        let jobs: BTreeSet<NamespacedId> = snap
            .allocs_by_node(&node_id)?
            .iter()
            .filter(|alloc| !alloc.is_terminal())
            .map(Allocation::job_key)
            .collect();
        Ok(jobs.into_iter().collect())
    }

    /// System allocations still running on a node that is otherwise done.
    ///
    /// Empty when the strategy ignores system jobs, when any non-system
    /// allocation is still running, or when the remaining system
    /// allocations are already marked for migration.
    pub fn remaining_system_allocs(&self) -> DrainResult<Vec<Allocation>> {
        let (node_id, strategy) = self.strategy()?;
        if strategy.ignore_system_jobs {
            return Ok(Vec::new());
        }
        let snap = self.store.snapshot()?;
        let allocs = classified_allocs(&snap, &node_id)?;
        if allocs
            .iter()
            .any(|(alloc, system)| !system && !alloc.is_terminal())
        {
            return Ok(Vec::new());
        }
        Ok(allocs
            .into_iter()
            .filter(|(alloc, system)| *system && !alloc.is_terminal() && !alloc.should_migrate())
            .map(|(alloc, _)| alloc)
            .collect())
    }
}

/// Allocations on a node paired with whether their job is a system job.
/// Allocations of purged jobs count as non-system.
fn classified_allocs(
    snap: &StateSnapshot,
    node_id: &str,
) -> DrainResult<Vec<(Allocation, bool)>> {
    let mut job_types: HashMap<NamespacedId, Option<JobType>> = HashMap::new();
    let mut out = Vec::new();
    for alloc in snap.allocs_by_node(node_id)? {
        let key = alloc.job_key();
        let job_type = match job_types.get(&key) {
            Some(job_type) => *job_type,
            None => {
                let job_type = snap
                    .job_by_id(&key.namespace, &key.id)?
                    .map(|job| job.job_type);
                job_types.insert(key, job_type);
                job_type
            }
        };
        out.push((alloc, job_type == Some(JobType::System)));
    }
    Ok(out)
}
