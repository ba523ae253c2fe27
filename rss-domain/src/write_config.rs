use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ShuffleWriteConfig
// ---------------------------------------------------------------------------

/// Write tuning shared by both client variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleWriteConfig {
    // ---
    /// Number of files the server splits each partition into.  Forwarded
    /// verbatim; the storage engine interprets it.
    pub num_splits: u16,
}

impl Default for ShuffleWriteConfig {
    fn default() -> Self {
        Self { num_splits: 1 }
    }
}

// ---------------------------------------------------------------------------
// WriteClientConfig
// ---------------------------------------------------------------------------

/// Immutable configuration for one outbound write connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteClientConfig {
    // ---
    pub host: String,
    pub port: u16,

    /// Bound on every network operation, including the finish-upload
    /// acknowledgment wait.
    pub timeout: Duration,

    /// Wait for the server to confirm finish-upload before reporting
    /// completion.  Without it, completion may be declared before the
    /// server has recorded the upload.
    pub finish_upload_ack: bool,

    pub user: String,
    pub app_id: String,
    pub app_attempt: String,

    /// Compression buffer size in bytes.  `0` selects the plain client.
    pub compress_buffer_size: usize,

    pub write: ShuffleWriteConfig,
}

// ---

impl WriteClientConfig {
    // ---
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Configuration with defaults for everything but identity and address.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        app_id: impl Into<String>,
        app_attempt: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Self::DEFAULT_TIMEOUT,
            finish_upload_ack: true,
            user: user.into(),
            app_id: app_id.into(),
            app_attempt: app_attempt.into(),
            compress_buffer_size: 0,
            write: ShuffleWriteConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_finish_upload_ack(mut self, ack: bool) -> Self {
        self.finish_upload_ack = ack;
        self
    }

    pub fn with_compress_buffer_size(mut self, size: usize) -> Self {
        self.compress_buffer_size = size;
        self
    }

    pub fn with_write_config(mut self, write: ShuffleWriteConfig) -> Self {
        self.write = write;
        self
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
