use serde::{Deserialize, Serialize};

use rss_domain::{AppMapId, Result, RssError};

/// Bumped whenever message shapes change incompatibly.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// ClientMsg
// ---------------------------------------------------------------------------

/// Control messages flowing client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    // ---
    /// First message on every connection.
    Connect {
        user: String,
        app_id: String,
        app_attempt: String,
        protocol_version: u8,
    },

    /// The records that follow belong to this attempt.
    StartUpload {
        app_map_id: AppMapId,
        attempt_id: i64,
        num_splits: u16,
    },

    /// No more records for the current attempt.  `ack` asks the server to
    /// reply with [`ServerMsg::FinishUploadAck`].
    FinishUpload { ack: bool },

    /// Commit an attempt (sent by the driver side).
    Commit { app_map_id: AppMapId, attempt_id: i64 },

    /// Orderly goodbye; the server closes its side.
    Close,
}

// ---------------------------------------------------------------------------
// ServerMsg
// ---------------------------------------------------------------------------

/// Control messages flowing server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    // ---
    Connected { server_id: String },

    UploadStarted,

    FinishUploadAck,

    Committed,

    Error {
        code: ErrorCode,
        message: String,
        retry_after_ms: Option<u64>,
    },
}

// ---

impl ServerMsg {
    // ---
    /// Wire form of a server-side failure.
    pub fn from_error(err: &RssError) -> Self {
        // ---
        let (code, retry_after_ms) = match err {
            RssError::InvalidState { .. } => (ErrorCode::InvalidState, None),
            RssError::UnknownAttempt { .. } => (ErrorCode::UnknownAttempt, None),
            RssError::Overloaded { retry_after_ms, .. } => {
                (ErrorCode::Overloaded, Some(*retry_after_ms))
            }
            RssError::ClientState(_) | RssError::Transport(_) => (ErrorCode::Protocol, None),
            _ => (ErrorCode::Internal, None),
        };
        ServerMsg::Error {
            code,
            message: err.to_string(),
            retry_after_ms,
        }
    }

    // ---

    /// Turn an `Error` reply into the matching [`RssError`]; pass anything
    /// else through.
    pub fn into_result(self) -> Result<ServerMsg> {
        // ---
        match self {
            ServerMsg::Error {
                code: ErrorCode::Overloaded,
                message,
                retry_after_ms,
            } => Err(RssError::Overloaded {
                reason: message,
                retry_after_ms: retry_after_ms.unwrap_or_default(),
            }),
            ServerMsg::Error { code, message, .. } => Err(RssError::Remote {
                code: code.as_str().to_string(),
                message,
                retryable: code.is_retryable(),
            }),
            other => Ok(other),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // ---
    InvalidState,
    UnknownAttempt,
    Overloaded,
    Protocol,
    Internal,
}

// ---

impl ErrorCode {
    // ---
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::UnknownAttempt => "UNKNOWN_ATTEMPT",
            ErrorCode::Overloaded => "OVERLOADED",
            ErrorCode::Protocol => "PROTOCOL",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Attempt-level failures are final; load shedding and server faults
    /// may clear on retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::Overloaded | ErrorCode::Internal)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
