//! Node drainer error types.

use nodedrain_state::{NodeId, StateError};
use thiserror::Error;

/// Errors raised by the drainer and by the log applier it submits to.
///
/// `Clone` so that one batch result can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum DrainError {
    /// A draining-node query ran against a node without a drain strategy.
    #[error("node {0} has no drain strategy")]
    NoStrategy(NodeId),

    /// The enclosing scope was cancelled before the work finished.
    #[error("drainer scope cancelled")]
    Cancelled,

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("log apply failed: {0}")]
    Apply(String),
}

impl DrainError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            DrainError::Cancelled => true,
            DrainError::State(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

pub type DrainResult<T> = Result<T, DrainError>;

/// Errors loading or validating a [`DrainerConfig`](crate::DrainerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
