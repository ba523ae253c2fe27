use async_trait::async_trait;

use super::attempt::AppMapId;
use super::error::Result;

// ---------------------------------------------------------------------------
// RecordUploadClient
// ---------------------------------------------------------------------------

/// Capability surface a map task uses to push its shuffle output.
///
/// Implemented by both the plain and the compressed write client; callers
/// never need to know which one they hold.  Expected call order:
///
/// ```text
/// connect → start_upload → write_record* → finish_upload → close
/// ```
///
/// `close` is legal at any point and releases socket and buffer resources.
/// Closing before `finish_upload` leaves the attempt's server-side state
/// wherever it last got to.
#[async_trait]
pub trait RecordUploadClient: Send {
    // ---
    /// Open the connection and perform the handshake.
    async fn connect(&mut self) -> Result<()>;

    /// Announce the attempt whose records follow.
    ///
    /// The server moves the attempt out of `NotStarted` or rejects it
    /// (duplicate start, admission refused).
    async fn start_upload(&mut self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()>;

    /// Queue one record for `partition`.
    async fn write_record(&mut self, partition: u32, key: &[u8], value: &[u8]) -> Result<()>;

    /// Flush everything buffered and signal the end of the upload.
    ///
    /// Waits for the server's acknowledgment when the client was configured
    /// with `finish_upload_ack`.
    async fn finish_upload(&mut self) -> Result<()>;

    /// Release the connection.  Idempotent.
    async fn close(&mut self) -> Result<()>;
}
