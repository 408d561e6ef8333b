//! nodedrain-state: the replicated state store seen by the node drainer.
//!
//! Backed by [redb](https://docs.rs/redb), it holds nodes, jobs, allocations
//! and evaluations. Every write consumes one raft-style index which is
//! stamped on the touched records and on the touched tables, and wakes any
//! pending blocking query.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Jobs are keyed by `{namespace}/{id}`, everything else by its id. Reads go
//! through a [`StateSnapshot`], which wraps a redb read transaction and so
//! sees one consistent point in time.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use snapshot::StateSnapshot;
pub use store::StateStore;
pub use tables::Table;
pub use types::*;
