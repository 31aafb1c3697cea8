//! Error types for handoff-rs.

use thiserror::Error;

use crate::model::State;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    /// The work item exists but is not in a state that accepts the request.
    #[error("work item {id} is {state}: {reason}")]
    InvalidState {
        id: String,
        state: State,
        reason: String,
    },

    /// Caller error: a work item id was reused with a different payload.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A worker wrote through a cache handle the coordinator already released.
    #[error("cache scope {0} is closed")]
    ScopeClosed(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP-style status for errors that are surfaced to callers.
    ///
    /// Internal failures return `None`; they are not the caller's fault.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::NotFound(_) => Some(404),
            Error::Conflict(_) => Some(409),
            Error::InvalidState { .. } => Some(409),
            Error::ScopeClosed(_) => Some(410),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
