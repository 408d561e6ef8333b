//! Domain types for the node-drain state store.
//!
//! These types represent the persisted state of nodes, jobs, allocations
//! and evaluations. All types are serializable to/from JSON for storage in
//! redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for an allocation.
pub type AllocId = String;

/// Unique identifier for a job (namespace-scoped).
pub type JobId = String;

/// Unique identifier for an evaluation.
pub type EvalId = String;

/// `triggered_by` value of evaluations created by the node drainer.
pub const EVAL_TRIGGER_NODE_DRAIN: &str = "node-drain";

/// Subsystem recorded on node events emitted by the node drainer.
pub const NODE_EVENT_SUBSYSTEM_DRAIN: &str = "Drain";

/// A `(namespace, id)` pair identifying a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedId {
    pub namespace: String,
    pub id: String,
}

impl NamespacedId {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// Build the composite key for the jobs table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.id)
    }
}

impl fmt::Display for NamespacedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Policy instructing the drainer to evacuate a node.
///
/// Two strategies are equal when their deadline instant and
/// `ignore_system_jobs` flag are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainStrategy {
    /// Absolute deadline; `None` drains without a deadline.
    pub deadline: Option<SystemTime>,
    /// Leave system allocations running and ignore them when deciding
    /// whether the node is done.
    pub ignore_system_jobs: bool,
}

impl DrainStrategy {
    /// A strategy that waits for migrations however long they take.
    pub fn without_deadline() -> Self {
        Self {
            deadline: None,
            ignore_system_jobs: false,
        }
    }

    /// A strategy whose deadline is `after` from now.
    pub fn with_deadline_in(after: Duration) -> Self {
        Self {
            deadline: Some(SystemTime::now() + after),
            ignore_system_jobs: false,
        }
    }

    pub fn ignoring_system_jobs(mut self) -> Self {
        self.ignore_system_jobs = true;
        self
    }

    pub fn is_infinite(&self) -> bool {
        self.deadline.is_none()
    }

    /// Whether the deadline is finite and not after `now`.
    pub fn deadline_reached(&self, now: SystemTime) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Whether the scheduler may place new work on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
}

/// An entry in a node's event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub message: String,
    pub subsystem: String,
    pub details: BTreeMap<String, String>,
    pub timestamp: SystemTime,
}

impl NodeEvent {
    pub fn new(subsystem: &str, message: &str) -> Self {
        Self {
            message: message.to_string(),
            subsystem: subsystem.to_string(),
            details: BTreeMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: &str) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// Information about a node in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    /// Set while an operator has the node draining.
    pub drain_strategy: Option<DrainStrategy>,
    pub scheduling_eligibility: SchedulingEligibility,
    pub events: Vec<NodeEvent>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl NodeInfo {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            drain_strategy: None,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            events: Vec::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.drain_strategy.is_some()
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// Scheduler type of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Service,
    Batch,
    System,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::Service => "service",
            JobType::Batch => "batch",
            JobType::System => "system",
        };
        f.write_str(s)
    }
}

/// Which signal marks a replacement allocation healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrateHealthCheck {
    /// Service checks must pass.
    #[default]
    Checks,
    /// All tasks must be running.
    TaskStates,
}

/// Per-task-group migration policy.
///
/// `min_healthy_time` and `healthy_deadline` are enforced by the
/// scheduler's deployment machinery; the drainer only reads
/// `max_parallel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateStrategy {
    pub max_parallel: u32,
    pub health_check: MigrateHealthCheck,
    pub min_healthy_time: Duration,
    pub healthy_deadline: Duration,
}

impl Default for MigrateStrategy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            health_check: MigrateHealthCheck::Checks,
            min_healthy_time: Duration::from_secs(10),
            healthy_deadline: Duration::from_secs(5 * 60),
        }
    }
}

/// A named group of identical task instances within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    /// Desired number of allocations.
    pub count: u32,
    pub migrate: Option<MigrateStrategy>,
}

impl TaskGroup {
    /// A group with the default migrate policy (one at a time).
    pub fn new(name: &str, count: u32) -> Self {
        Self {
            name: name.to_string(),
            count,
            migrate: Some(MigrateStrategy::default()),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: u32) -> Self {
        self.migrate
            .get_or_insert_with(MigrateStrategy::default)
            .max_parallel = max_parallel;
        self
    }
}

/// A registered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub namespace: String,
    pub name: String,
    pub job_type: JobType,
    pub priority: u32,
    pub task_groups: Vec<TaskGroup>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Job {
    /// Default scheduling priority of a job.
    pub const DEFAULT_PRIORITY: u32 = 50;

    pub fn new(namespace: &str, id: &str, job_type: JobType) -> Self {
        Self {
            id: id.to_string(),
            namespace: namespace.to_string(),
            name: id.to_string(),
            job_type,
            priority: Self::DEFAULT_PRIORITY,
            task_groups: Vec::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn with_task_group(mut self, group: TaskGroup) -> Self {
        self.task_groups.push(group);
        self
    }

    pub fn key(&self) -> NamespacedId {
        NamespacedId::new(&self.namespace, &self.id)
    }

    /// Build the composite key for the jobs table.
    pub fn table_key(&self) -> String {
        self.key().table_key()
    }

    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }
}

// ── Allocation ────────────────────────────────────────────────────

/// Status of an allocation as reported by the client running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl ClientStatus {
    /// Complete, failed and lost are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClientStatus::Complete | ClientStatus::Failed | ClientStatus::Lost
        )
    }
}

/// Directives consumed by the scheduler. The drainer only sets `migrate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredTransition {
    pub migrate: Option<bool>,
}

impl DesiredTransition {
    pub fn migrate() -> Self {
        Self {
            migrate: Some(true),
        }
    }

    pub fn should_migrate(&self) -> bool {
        self.migrate == Some(true)
    }

    /// Overlay the fields set in `other`.
    pub fn merge(&mut self, other: &DesiredTransition) {
        if other.migrate.is_some() {
            self.migrate = other.migrate;
        }
    }
}

/// Deployment health of an allocation, set by the deployment watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocDeploymentStatus {
    pub healthy: Option<bool>,
}

/// Placement of one task group instance on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    pub namespace: String,
    pub job_id: JobId,
    pub task_group: String,
    pub node_id: NodeId,
    pub client_status: ClientStatus,
    pub desired_transition: DesiredTransition,
    pub deployment_status: Option<AllocDeploymentStatus>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Allocation {
    /// A running allocation of `job`'s `task_group` placed on `node_id`.
    pub fn new(id: &str, job: &Job, task_group: &str, node_id: &str) -> Self {
        Self {
            id: id.to_string(),
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            task_group: task_group.to_string(),
            node_id: node_id.to_string(),
            client_status: ClientStatus::Running,
            desired_transition: DesiredTransition::default(),
            deployment_status: None,
            create_index: 0,
            modify_index: 0,
        }
    }

    /// Mark the allocation's deployment health.
    pub fn with_health(mut self, healthy: bool) -> Self {
        self.deployment_status = Some(AllocDeploymentStatus {
            healthy: Some(healthy),
        });
        self
    }

    pub fn job_key(&self) -> NamespacedId {
        NamespacedId::new(&self.namespace, &self.job_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.client_status.is_terminal()
    }

    /// Whether the deployment watcher has marked this allocation healthy.
    pub fn is_healthy(&self) -> bool {
        self.deployment_status
            .as_ref()
            .and_then(|ds| ds.healthy)
            .unwrap_or(false)
    }

    pub fn should_migrate(&self) -> bool {
        self.desired_transition.should_migrate()
    }
}

// ── Evaluation ────────────────────────────────────────────────────

/// Lifecycle status of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Pending,
    Complete,
    Failed,
}

/// A request for the scheduler to re-plan one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    pub namespace: String,
    pub priority: u32,
    pub job_type: JobType,
    pub triggered_by: String,
    pub job_id: JobId,
    pub status: EvalStatus,
    pub create_time: SystemTime,
    pub modify_time: SystemTime,
    pub create_index: u64,
    pub modify_index: u64,
}
