use std::time::Duration;

use thiserror::Error;

use super::attempt::{AppMapId, TaskAttemptState};

// ---------------------------------------------------------------------------
// RssError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RssError {
    // ---
    /// A protocol event arrived for an attempt whose state forbids it.
    #[error(
        "cannot mark attempt to state {target} from its current state {current}, {app_map_id}, {attempt_id}"
    )]
    InvalidState {
        app_map_id: AppMapId,
        attempt_id: i64,
        current: TaskAttemptState,
        target: TaskAttemptState,
    },

    /// A finish or commit referenced an attempt that was never started.
    #[error("unknown task attempt {app_map_id}, {attempt_id}")]
    UnknownAttempt { app_map_id: AppMapId, attempt_id: i64 },

    /// Client used out of order (e.g. a record written before start-upload).
    #[error("invalid client state: {0}")]
    ClientState(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// New uploads are being shed (memory pressure or in-flight limit).
    #[error("server overloaded ({reason}), retry after {retry_after_ms} ms")]
    Overloaded { reason: String, retry_after_ms: u64 },

    /// Error reported by the server over the wire.
    #[error("server error [{code}]: {message}")]
    Remote {
        code: String,
        message: String,
        retryable: bool,
    },

    /// The platform facility backing the memory monitor failed.
    #[error("platform failure: {0}")]
    Platform(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl RssError {
    // ---
    /// `true` for errors a caller may resolve by reconnecting and retrying
    /// (with a new attempt id when the attempt already reached the server).
    pub fn is_retryable(&self) -> bool {
        match self {
            RssError::Transport(_) | RssError::Timeout { .. } | RssError::Io(_) => true,
            RssError::Overloaded { .. } => true,
            RssError::Remote { retryable, .. } => *retryable,
            RssError::InvalidState { .. }
            | RssError::UnknownAttempt { .. }
            | RssError::ClientState(_)
            | RssError::Platform(_) => false,
        }
    }

    // ---

    /// An unknown attempt is treated the same as one that never started.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            RssError::InvalidState { .. } | RssError::UnknownAttempt { .. }
        )
    }
}

// ---

pub type Result<T> = std::result::Result<T, RssError>;
