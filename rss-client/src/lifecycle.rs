//! Connection and upload bookkeeping shared by both write client variants.
//!
//! The variants differ only in how records reach the wire; connecting,
//! start-upload, finish-upload and close are the same exchange for both.

use rss_domain::{AppMapId, Result, RssError, WriteClientConfig};

// ---

use super::connection::ServerConnection;

// ---------------------------------------------------------------------------
// UploadTarget
// ---------------------------------------------------------------------------

/// The attempt a client is currently uploading for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UploadTarget {
    pub app_map_id: AppMapId,
    pub attempt_id: i64,
}

// ---------------------------------------------------------------------------
// UploadLifecycle
// ---------------------------------------------------------------------------

pub(crate) struct UploadLifecycle {
    // ---
    config: WriteClientConfig,
    conn: Option<ServerConnection>,
    upload: Option<UploadTarget>,
    closed: bool,
}

// ---

impl UploadLifecycle {
    // ---
    pub fn new(config: WriteClientConfig) -> Self {
        Self {
            config,
            conn: None,
            upload: None,
            closed: false,
        }
    }

    pub fn with_connection(config: WriteClientConfig, conn: ServerConnection) -> Self {
        Self {
            conn: Some(conn),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &WriteClientConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ---

    pub async fn connect(&mut self) -> Result<()> {
        // ---
        if self.closed {
            return Err(RssError::ClientState("client is closed".into()));
        }
        if self.conn.is_none() {
            self.conn = Some(ServerConnection::open(&self.config).await?);
        }
        Ok(())
    }

    pub fn conn_mut(&mut self) -> Result<&mut ServerConnection> {
        // ---
        if self.closed {
            return Err(RssError::ClientState("client is closed".into()));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| RssError::ClientState("client is not connected".into()))
    }

    /// The upload in progress, or a client-state error naming `op`.
    pub fn require_upload(&self, op: &str) -> Result<&UploadTarget> {
        self.upload
            .as_ref()
            .ok_or_else(|| RssError::ClientState(format!("{op} called before start_upload")))
    }

    // ---

    pub async fn start(&mut self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()> {
        // ---
        if let Some(current) = &self.upload {
            return Err(RssError::ClientState(format!(
                "upload already in progress for {} attempt {}",
                current.app_map_id, current.attempt_id
            )));
        }
        let num_splits = self.config.write.num_splits;
        self.conn_mut()?
            .start_upload(app_map_id, attempt_id, num_splits)
            .await?;

        self.upload = Some(UploadTarget {
            app_map_id: app_map_id.clone(),
            attempt_id,
        });
        Ok(())
    }

    /// Signal the end of the upload.  The caller flushes its buffers first.
    pub async fn finish(&mut self) -> Result<UploadTarget> {
        // ---
        let target = self.require_upload("finish_upload")?.clone();
        let ack = self.config.finish_upload_ack;
        self.conn_mut()?.finish_upload(ack).await?;
        self.upload = None;
        Ok(target)
    }

    /// Idempotent.  A failed goodbye is logged, not returned.
    pub async fn close(&mut self) {
        // ---
        if self.closed {
            return;
        }
        self.closed = true;
        self.upload = None;

        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                tracing::debug!(error = %e, "write client close: goodbye not delivered");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::{connected_pair, test_config};

    #[tokio::test]
    async fn one_upload_at_a_time_per_session() {
        // ---
        let (conn, server) = connected_pair(test_config()).await;
        let mut session = UploadLifecycle::with_connection(test_config(), conn);
        let id = AppMapId::new("app", 1);

        assert!(matches!(
            session.finish().await.unwrap_err(),
            RssError::ClientState(_)
        ));
        session.start(&id, 1).await.unwrap();
        assert!(matches!(
            session.start(&id, 2).await.unwrap_err(),
            RssError::ClientState(_)
        ));

        let done = session.finish().await.unwrap();
        assert_eq!(
            done,
            UploadTarget {
                app_map_id: id.clone(),
                attempt_id: 1,
            }
        );
        session.start(&id, 2).await.unwrap();
        session.finish().await.unwrap();

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(session.conn_mut().is_err());

        let log = server.await.unwrap();
        assert_eq!(log.starts, vec![(id.clone(), 1), (id, 2)]);
    }
}
