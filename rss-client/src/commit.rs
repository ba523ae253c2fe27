use rss_domain::{AppMapId, Result, WriteClientConfig};

// ---

use super::connection::ServerConnection;

// ---------------------------------------------------------------------------
// CommitClient
// ---------------------------------------------------------------------------

/// Driver-side client that marks map task attempts committed.
///
/// Shares the connection type with the write clients but never uploads;
/// one connection may commit any number of attempts.
pub struct CommitClient {
    conn: ServerConnection,
}

// ---

impl CommitClient {
    // ---
    pub async fn connect(config: &WriteClientConfig) -> Result<Self> {
        Ok(Self {
            conn: ServerConnection::open(config).await?,
        })
    }

    pub fn with_connection(conn: ServerConnection) -> Self {
        Self { conn }
    }

    pub fn server_id(&self) -> &str {
        self.conn.server_id()
    }

    /// Commit one attempt.  Re-committing a committed attempt succeeds.
    pub async fn commit(&mut self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()> {
        // ---
        self.conn.commit(app_map_id, attempt_id).await?;
        tracing::debug!(%app_map_id, attempt_id, "attempt committed");
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.conn.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use rss_domain::RssError;

    use super::*;
    use crate::test_support::{connected_pair, connected_pair_with, test_config, Behaviour};

    #[tokio::test]
    async fn commits_travel_in_order() {
        // ---
        let (conn, server) = connected_pair(test_config()).await;
        let mut client = CommitClient::with_connection(conn);
        assert_eq!(client.server_id(), "fake-1");

        let id = AppMapId::new("app", 2);
        client.commit(&id, 1).await.unwrap();
        client.commit(&id, 3).await.unwrap();
        client.close().await.unwrap();

        let log = server.await.unwrap();
        assert_eq!(log.commits, vec![(id.clone(), 1), (id, 3)]);
    }

    #[tokio::test]
    async fn silent_server_times_out_as_retryable() {
        // ---
        let config = test_config().with_timeout(Duration::from_millis(50));
        let (conn, _server) = connected_pair_with(config, Behaviour::StallAfterHandshake).await;
        let mut client = CommitClient::with_connection(conn);

        let err = client.commit(&AppMapId::new("app", 0), 1).await.unwrap_err();
        assert!(matches!(err, RssError::Timeout { op: "recv", .. }));
        assert!(err.is_retryable());
    }
}
