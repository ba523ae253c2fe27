use async_trait::async_trait;

// ---

use rss_domain::{
    // ---
    AppMapId,
    RecordUploadClient,
    Result,
    RssError,
    ServerDetail,
    ServiceRegistry,
    WriteClientConfig,
};

// ---

use super::compressed::CompressedRecordWriteClient;
use super::plain::PlainRecordWriteClient;

// ---------------------------------------------------------------------------
// WriteClient
// ---------------------------------------------------------------------------

/// A record upload client of either variant.
///
/// Closed set, so an enum rather than a trait object; callers that only
/// need the capability can still hold it as `dyn RecordUploadClient`.
pub enum WriteClient {
    Plain(PlainRecordWriteClient),
    Compressed(CompressedRecordWriteClient),
}

// ---

impl WriteClient {
    // ---
    pub fn is_compressed(&self) -> bool {
        matches!(self, WriteClient::Compressed(_))
    }

    pub fn config(&self) -> &WriteClientConfig {
        match self {
            WriteClient::Plain(c) => c.config(),
            WriteClient::Compressed(c) => c.config(),
        }
    }
}

// ---

impl std::fmt::Debug for WriteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = if self.is_compressed() { "Compressed" } else { "Plain" };
        f.debug_struct("WriteClient")
            .field("variant", &variant)
            .field("address", &self.config().address())
            .finish()
    }
}

// ---

#[async_trait]
impl RecordUploadClient for WriteClient {
    // ---
    async fn connect(&mut self) -> Result<()> {
        match self {
            WriteClient::Plain(c) => c.connect().await,
            WriteClient::Compressed(c) => c.connect().await,
        }
    }

    async fn start_upload(&mut self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()> {
        match self {
            WriteClient::Plain(c) => c.start_upload(app_map_id, attempt_id).await,
            WriteClient::Compressed(c) => c.start_upload(app_map_id, attempt_id).await,
        }
    }

    async fn write_record(&mut self, partition: u32, key: &[u8], value: &[u8]) -> Result<()> {
        match self {
            WriteClient::Plain(c) => c.write_record(partition, key, value).await,
            WriteClient::Compressed(c) => c.write_record(partition, key, value).await,
        }
    }

    async fn finish_upload(&mut self) -> Result<()> {
        match self {
            WriteClient::Plain(c) => c.finish_upload().await,
            WriteClient::Compressed(c) => c.finish_upload().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            WriteClient::Plain(c) => c.close().await,
            WriteClient::Compressed(c) => c.close().await,
        }
    }
}

// ---------------------------------------------------------------------------
// WriteClientFactory
// ---------------------------------------------------------------------------

/// Produces write clients from configuration.
pub trait WriteClientFactory: Send + Sync {
    fn get_or_create_client(&self, config: &WriteClientConfig) -> WriteClient;
}

// ---

/// Creates a fresh client on every call; nothing is pooled or shared.
///
/// The variant follows `compress_buffer_size`: positive selects the
/// compressed client, zero the plain one.  Construction does no I/O; the
/// caller drives [`RecordUploadClient::connect`] next.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnpooledWriteClientFactory;

impl UnpooledWriteClientFactory {
    pub fn new() -> Self {
        Self
    }
}

impl WriteClientFactory for UnpooledWriteClientFactory {
    // ---
    fn get_or_create_client(&self, config: &WriteClientConfig) -> WriteClient {
        // ---
        if config.compress_buffer_size > 0 {
            tracing::debug!(
                address = %config.address(),
                compress_buffer_size = config.compress_buffer_size,
                "creating compressed record write client",
            );
            WriteClient::Compressed(CompressedRecordWriteClient::new(config.clone()))
        } else {
            tracing::debug!(
                address = %config.address(),
                "creating plain record write client",
            );
            WriteClient::Plain(PlainRecordWriteClient::new(config.clone()))
        }
    }
}

// ---------------------------------------------------------------------------
// Server selection
// ---------------------------------------------------------------------------

/// Pick the server responsible for `app_map_id` among those registered in
/// `data_center`/`cluster`.  Stable for a fixed server list.
pub fn resolve_server(
    registry: &dyn ServiceRegistry,
    data_center: &str,
    cluster: &str,
    app_map_id: &AppMapId,
) -> Result<ServerDetail> {
    // ---
    let mut servers = registry.get_servers(data_center, cluster)?;
    if servers.is_empty() {
        return Err(RssError::Transport(format!(
            "no shuffle servers registered in {data_center}/{cluster}"
        )));
    }
    servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
    let index = (app_map_id.map_id.unsigned_abs() as usize) % servers.len();
    Ok(servers.swap_remove(index))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
