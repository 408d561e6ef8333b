//! redb table definitions for the node-drain state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Jobs use the composite key `{namespace}/{id}`.

use redb::TableDefinition;

/// Node records keyed by `{node_id}`.
pub const NODES: RecordTable = TableDefinition::new("nodes");

/// Job specs keyed by `{namespace}/{job_id}`.
pub const JOBS: RecordTable = TableDefinition::new("jobs");

/// Allocations keyed by `{alloc_id}`.
pub const ALLOCS: RecordTable = TableDefinition::new("allocs");

/// Evaluations keyed by `{eval_id}`.
pub const EVALS: RecordTable = TableDefinition::new("evals");

/// Raft-style indexes keyed by table name, plus [`LATEST_INDEX_KEY`].
pub const INDEXES: TableDefinition<&str, u64> = TableDefinition::new("indexes");

/// Key of the store-wide latest index in [`INDEXES`].
pub const LATEST_INDEX_KEY: &str = "latest";

/// Record tables whose last-write index is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nodes,
    Jobs,
    Allocs,
    Evals,
}

impl Table {
    /// Name under which the table's index is stored.
    pub fn name(self) -> &'static str {
        match self {
            Table::Nodes => "nodes",
            Table::Jobs => "jobs",
            Table::Allocs => "allocs",
            Table::Evals => "evals",
        }
    }
}

/// Definition shape shared by the record tables.
pub type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Serialize a record into its stored JSON form.
pub(crate) fn encode<T: serde::Serialize>(value: &T) -> crate::StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(crate::error::map_err!(Serialize))
}

/// Deserialize a stored JSON record.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> crate::StateResult<T> {
    serde_json::from_slice(bytes).map_err(crate::error::map_err!(Deserialize))
}
