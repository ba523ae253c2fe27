use async_trait::async_trait;

// ---

use rss_domain::{AppMapId, RecordUploadClient, Result, WriteClientConfig};
use rss_protocol::{encode_record, FrameKind};

// ---

use super::connection::ServerConnection;
use super::lifecycle::UploadLifecycle;

// ---------------------------------------------------------------------------
// PlainRecordWriteClient
// ---------------------------------------------------------------------------

/// Sends every record to the server as soon as it is written.
pub struct PlainRecordWriteClient {
    // ---
    session: UploadLifecycle,

    /// Reused encode buffer; holds at most one record.
    scratch: Vec<u8>,

    records_written: u64,
    bytes_written: u64,
}

// ---

impl PlainRecordWriteClient {
    // ---
    /// Construct without touching the network.
    pub fn new(config: WriteClientConfig) -> Self {
        Self::from_session(UploadLifecycle::new(config))
    }

    /// Construct around an already-handshaken connection.
    pub fn with_connection(config: WriteClientConfig, conn: ServerConnection) -> Self {
        Self::from_session(UploadLifecycle::with_connection(config, conn))
    }

    fn from_session(session: UploadLifecycle) -> Self {
        Self {
            session,
            scratch: Vec::new(),
            records_written: 0,
            bytes_written: 0,
        }
    }

    pub fn config(&self) -> &WriteClientConfig {
        self.session.config()
    }

    /// Records written during the current (or last) upload.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Encoded bytes written during the current (or last) upload.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

// ---

#[async_trait]
impl RecordUploadClient for PlainRecordWriteClient {
    // ---
    async fn connect(&mut self) -> Result<()> {
        self.session.connect().await
    }

    async fn start_upload(&mut self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()> {
        // ---
        self.session.start(app_map_id, attempt_id).await?;
        self.records_written = 0;
        self.bytes_written = 0;
        tracing::debug!(%app_map_id, attempt_id, "plain upload started");
        Ok(())
    }

    async fn write_record(&mut self, partition: u32, key: &[u8], value: &[u8]) -> Result<()> {
        // ---
        self.session.require_upload("write_record")?;
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        encode_record(&mut scratch, partition, key, value)?;

        let sent = match self.session.conn_mut() {
            Ok(conn) => conn.send_records(FrameKind::Records, &scratch).await,
            Err(e) => Err(e),
        };
        let len = scratch.len() as u64;
        self.scratch = scratch;
        sent?;

        self.records_written += 1;
        self.bytes_written += len;
        Ok(())
    }

    async fn finish_upload(&mut self) -> Result<()> {
        // ---
        let target = self.session.finish().await?;
        tracing::info!(
            app_map_id = %target.app_map_id,
            attempt_id = target.attempt_id,
            records = self.records_written,
            bytes = self.bytes_written,
            ack = self.session.config().finish_upload_ack,
            "plain upload finished",
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.scratch = Vec::new();
        self.session.close().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use rss_protocol::decode_records;

    use rss_domain::RssError;

    use super::*;
    use crate::test_support::{connected_pair, test_config, ServerLog};

    #[tokio::test]
    async fn write_before_start_is_a_client_state_error() {
        // ---
        let (conn, server) = connected_pair(test_config()).await;
        let mut client = PlainRecordWriteClient::with_connection(test_config(), conn);

        let err = client.write_record(0, b"k", b"v").await.unwrap_err();
        assert!(matches!(err, RssError::ClientState(_)));

        client.close().await.unwrap();
        let log: ServerLog = server.await.unwrap();
        assert!(log.data_frames.is_empty());
    }

    #[tokio::test]
    async fn each_record_goes_out_in_its_own_frame() {
        // ---
        let (conn, server) = connected_pair(test_config()).await;
        let mut client = PlainRecordWriteClient::with_connection(test_config(), conn);
        let id = AppMapId::new("app", 3);

        client.start_upload(&id, 7).await.unwrap();
        client.write_record(0, b"a", b"1").await.unwrap();
        client.write_record(1, b"b", b"22").await.unwrap();
        client.write_record(0, b"", b"").await.unwrap();
        client.finish_upload().await.unwrap();
        assert_eq!(client.records_written(), 3);
        client.close().await.unwrap();

        let log = server.await.unwrap();
        assert_eq!(log.data_frames.len(), 3);
        assert!(log.data_frames.iter().all(|f| f.kind == FrameKind::Records));

        let second = decode_records(&log.data_frames[1].payload).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].partition, 1);
        assert_eq!(second[0].value, b"22");
        assert_eq!(log.finish_acks_requested, vec![true]);
    }

    #[tokio::test]
    async fn second_start_without_finish_is_rejected_locally() {
        let (conn, _server) = connected_pair(test_config()).await;
        let mut client = PlainRecordWriteClient::with_connection(test_config(), conn);
        let id = AppMapId::new("app", 1);

        client.start_upload(&id, 1).await.unwrap();
        let err = client.start_upload(&id, 2).await.unwrap_err();
        assert!(matches!(err, RssError::ClientState(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_use() {
        let (conn, _server) = connected_pair(test_config()).await;
        let mut client = PlainRecordWriteClient::with_connection(test_config(), conn);

        client.close().await.unwrap();
        client.close().await.unwrap();

        let err = client.start_upload(&AppMapId::new("a", 1), 1).await.unwrap_err();
        assert!(matches!(err, RssError::ClientState(_)));
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn finish_without_ack_does_not_wait() {
        // ---
        let config = test_config().with_finish_upload_ack(false);
        let (conn, server) = connected_pair(config.clone()).await;
        let mut client = PlainRecordWriteClient::with_connection(config, conn);

        client.start_upload(&AppMapId::new("a", 1), 1).await.unwrap();
        client.write_record(0, b"k", b"v").await.unwrap();
        client.finish_upload().await.unwrap();
        client.close().await.unwrap();

        let log = server.await.unwrap();
        assert_eq!(log.finish_acks_requested, vec![false]);
    }
}
