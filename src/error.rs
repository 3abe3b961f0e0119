//! Error types for workq.

use thiserror::Error;

use crate::model::{Status, WorkItemId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// The claim on an item was lost (another worker holds it, or it left
    /// `in_progress`). Expected during claim races; never fatal to a poll.
    #[error("claim lost on work item {0}")]
    ClaimLost(WorkItemId),

    #[error("no processor registered for work type {0:?}")]
    UnknownItemType(String),

    /// A processor broke the proxy contract (second outcome, progress after
    /// an outcome, or returning without any outcome).
    #[error("processor protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("cancel called on work item {0} without a pending cancel request")]
    CancelNotRequested(WorkItemId),

    #[error("processor failed: {0}")]
    Processor(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for processors reporting a business-level failure.
    pub fn processor(msg: impl Into<String>) -> Self {
        Error::Processor(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
