use async_trait::async_trait;

// ---

use rss_domain::{AppMapId, RecordUploadClient, Result, RssError, WriteClientConfig};
use rss_protocol::framing::MAX_PAYLOAD_LEN;
use rss_protocol::{compress_block, encode_record, encoded_len, FrameKind};

// ---

use super::connection::ServerConnection;
use super::lifecycle::UploadLifecycle;

// ---------------------------------------------------------------------------
// CompressedRecordWriteClient
// ---------------------------------------------------------------------------

/// Buffers encoded records and ships them as LZ4 blocks.
///
/// A block is flushed whenever the buffer reaches the configured
/// `compress_buffer_size`, before a record that would push it past that
/// size, and unconditionally before finish-upload, so a completed upload
/// never leaves records behind in the buffer.  A record larger than the
/// buffer size goes out as a block of its own.
///
/// The buffer size is capped at the frame payload limit.  A block that LZ4
/// cannot shrink below that limit is sent as a plain records frame instead.
pub struct CompressedRecordWriteClient {
    // ---
    session: UploadLifecycle,

    /// Encoded, not yet compressed records.
    buffer: Vec<u8>,
    buffer_size: usize,

    records_written: u64,
    bytes_written: u64,
    blocks_flushed: u64,
    compressed_bytes: u64,
}

// ---

impl CompressedRecordWriteClient {
    // ---
    /// Construct without touching the network.  A zero
    /// `compress_buffer_size` is treated as one byte, i.e. a block per
    /// record.
    pub fn new(config: WriteClientConfig) -> Self {
        Self::from_session(UploadLifecycle::new(config))
    }

    /// Construct around an already-handshaken connection.
    pub fn with_connection(config: WriteClientConfig, conn: ServerConnection) -> Self {
        Self::from_session(UploadLifecycle::with_connection(config, conn))
    }

    fn from_session(session: UploadLifecycle) -> Self {
        let buffer_size = session.config().compress_buffer_size.clamp(1, MAX_PAYLOAD_LEN);
        Self {
            session,
            buffer: Vec::new(),
            buffer_size,
            records_written: 0,
            bytes_written: 0,
            blocks_flushed: 0,
            compressed_bytes: 0,
        }
    }

    pub fn config(&self) -> &WriteClientConfig {
        self.session.config()
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn blocks_flushed(&self) -> u64 {
        self.blocks_flushed
    }

    /// Bytes currently held in the uncompressed buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Effective flush threshold after capping.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    // ---

    /// Compress and send whatever is buffered.  No-op on an empty buffer.
    async fn flush_block(&mut self) -> Result<()> {
        // ---
        if self.buffer.is_empty() {
            return Ok(());
        }
        let block = compress_block(&self.buffer);
        let (kind, payload) = if block.len() <= MAX_PAYLOAD_LEN {
            (FrameKind::CompressedRecords, block.as_slice())
        } else {
            (FrameKind::Records, self.buffer.as_slice())
        };
        self.session.conn_mut()?.send_records(kind, payload).await?;

        tracing::trace!(
            raw = self.buffer.len(),
            sent = payload.len(),
            ?kind,
            "flushed record block",
        );
        self.blocks_flushed += 1;
        self.compressed_bytes += payload.len() as u64;
        self.buffer.clear();
        Ok(())
    }
}

// ---

#[async_trait]
impl RecordUploadClient for CompressedRecordWriteClient {
    // ---
    async fn connect(&mut self) -> Result<()> {
        self.session.connect().await
    }

    async fn start_upload(&mut self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()> {
        // ---
        self.session.start(app_map_id, attempt_id).await?;
        self.buffer.clear();
        self.records_written = 0;
        self.bytes_written = 0;
        self.blocks_flushed = 0;
        self.compressed_bytes = 0;
        tracing::debug!(
            %app_map_id,
            attempt_id,
            buffer_size = self.buffer_size,
            "compressed upload started",
        );
        Ok(())
    }

    async fn write_record(&mut self, partition: u32, key: &[u8], value: &[u8]) -> Result<()> {
        // ---
        self.session.require_upload("write_record")?;
        let len = encoded_len(key, value);
        if len > MAX_PAYLOAD_LEN {
            return Err(RssError::Transport(format!(
                "record of {len} bytes exceeds limit {MAX_PAYLOAD_LEN}"
            )));
        }
        if self.buffer.len() + len > self.buffer_size {
            self.flush_block().await?;
        }

        encode_record(&mut self.buffer, partition, key, value)?;
        self.records_written += 1;
        self.bytes_written += len as u64;

        if self.buffer.len() >= self.buffer_size {
            self.flush_block().await?;
        }
        Ok(())
    }

    async fn finish_upload(&mut self) -> Result<()> {
        // ---
        self.session.require_upload("finish_upload")?;
        self.flush_block().await?;

        let target = self.session.finish().await?;
        tracing::info!(
            app_map_id = %target.app_map_id,
            attempt_id = target.attempt_id,
            records = self.records_written,
            raw_bytes = self.bytes_written,
            compressed_bytes = self.compressed_bytes,
            blocks = self.blocks_flushed,
            ack = self.session.config().finish_upload_ack,
            "compressed upload finished",
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // ---
        if self.session.is_closed() {
            return Ok(());
        }
        if !self.buffer.is_empty() {
            tracing::debug!(
                buffered = self.buffer.len(),
                "compressed client closed mid-upload; discarding buffer",
            );
        }
        self.buffer = Vec::new();
        self.session.close().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
