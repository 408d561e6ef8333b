//! nodedrain: leader-side coordination of node drains.
//!
//! An operator marks a node as draining by giving it a drain strategy. The
//! drainer then migrates the node's allocations away without breaking any
//! task group's `max_parallel` budget, forces whatever remains once the
//! deadline passes, and finally clears the strategy with a
//! "Node drain complete" event.
//!
//! The drainer only reads the [`StateStore`](nodedrain_state::StateStore);
//! every write goes through a [`RaftApplier`].
//!
//! # Architecture
//!
//! ```text
//! NodeDrainer (enabled on the leader)
//!   ├── NodeDrainWatcher ──► DrainingRegistry ──► DeadlineHeap
//!   │        │ progress              │ register jobs      │ deadline batches
//!   │        ▼                       ▼                    ▼
//!   │   main loop ◄──── drain / migrated ──── DrainingJobWatcher
//!   │        │
//!   └── AllocMigrateBatcher ──► RaftApplier
//! ```
//!
//! All background tasks share one cancellation scope per enabled period
//! and one state-query [`RateLimiter`].

pub mod batcher;
pub mod config;
pub mod deadline;
pub mod drainer;
pub mod draining_node;
pub mod error;
pub mod future;
pub mod limiter;
pub mod raft;
pub mod registry;
pub mod tasks;
pub mod watch_jobs;
pub mod watch_nodes;

pub use batcher::AllocMigrateBatcher;
pub use config::DrainerConfig;
pub use deadline::{DeadlineHeap, DeadlineNotifier};
pub use drainer::{NODE_DRAIN_COMPLETE_MESSAGE, NODE_DRAIN_DEADLINE_REACHED_DETAIL, NodeDrainer};
pub use draining_node::DrainingNode;
pub use error::{ConfigError, DrainError, DrainResult};
pub use future::BatchFuture;
pub use limiter::RateLimiter;
pub use raft::{RaftApplier, Request, StoreApplier};
pub use registry::{DrainingRegistry, JobRegistrar, NodeTracker};
pub use tasks::BackgroundTasks;
pub use watch_jobs::{DrainDecision, DrainRequest, DrainingJobWatcher};
pub use watch_nodes::{NodeAction, NodeDrainWatcher};
