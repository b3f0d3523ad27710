//! Error taxonomy for evoseed
//!
//! Every failure is fatal for the run: nothing here is retried, and the only
//! recovery path is resuming from the last checkpoint that was written.

use std::path::PathBuf;

/// Errors raised by configuration, checkpointing, communication and adapters
#[derive(Debug, thiserror::Error)]
pub enum EvoError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("No saved state found at {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("Checkpoint protocol mismatch: {0}")]
    CheckpointProtocolMismatch(String),

    #[error("Checkpoint was written by {saved} workers but {current} are running")]
    CheckpointWorldSizeMismatch { saved: usize, current: usize },

    #[error("Checkpoint shard missing or unreadable: {}", .0.display())]
    CheckpointShardMissing(PathBuf),

    #[error("Checkpoint shard corrupt at {}: {reason}", .path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EvoError>;

impl EvoError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        EvoError::Configuration(msg.into())
    }

    pub(crate) fn comm(msg: impl Into<String>) -> Self {
        EvoError::Communication(msg.into())
    }

    pub(crate) fn agent(msg: impl Into<String>) -> Self {
        EvoError::Agent(msg.into())
    }
}
