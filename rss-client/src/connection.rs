//! One framed, timeout-bounded connection to a shuffle server.
//!
//! Shared by both write client variants and the commit client.  Every
//! network operation is wrapped in the configured timeout; expiry surfaces
//! as [`RssError::Timeout`], which callers treat as retryable.

use std::future::Future;
use std::time::Duration;

// ---

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

// ---

use rss_domain::{AppMapId, Result, RssError, WriteClientConfig};
use rss_protocol::{
    // ---
    read_control,
    write_control,
    write_frame,
    ClientMsg,
    FrameKind,
    ServerMsg,
    PROTOCOL_VERSION,
};

// ---------------------------------------------------------------------------
// ConnStream
// ---------------------------------------------------------------------------

/// Any duplex byte stream a connection can run over.  TCP in production,
/// `tokio::io::duplex` in tests.
pub trait ConnStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnStream for T {}

/// Convenience type alias for a heap-allocated [`ConnStream`].
pub type ConnStreamPtr = Box<dyn ConnStream>;

// ---------------------------------------------------------------------------
// ServerConnection
// ---------------------------------------------------------------------------

pub struct ServerConnection {
    // ---
    stream: ConnStreamPtr,
    timeout: Duration,

    /// Identity reported by the server in its `Connected` reply.
    server_id: String,
}

// ---

impl ServerConnection {
    // ---
    /// Dial `config.address()` and perform the handshake.
    pub async fn open(config: &WriteClientConfig) -> Result<Self> {
        // ---
        let addr = config.address();
        let tcp = with_timeout("connect", config.timeout, async {
            TcpStream::connect(&addr)
                .await
                .map_err(|e| RssError::Transport(format!("connect {addr}: {e}")))
        })
        .await?;
        tcp.set_nodelay(true)?;

        Self::establish(Box::new(tcp), config).await
    }

    // ---

    /// Perform the handshake over an already-open stream.
    pub async fn establish(stream: ConnStreamPtr, config: &WriteClientConfig) -> Result<Self> {
        // ---
        let mut conn = Self {
            stream,
            timeout: config.timeout,
            server_id: String::new(),
        };

        conn.send(&ClientMsg::Connect {
            user: config.user.clone(),
            app_id: config.app_id.clone(),
            app_attempt: config.app_attempt.clone(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await?;

        match conn.recv().await? {
            ServerMsg::Connected { server_id } => conn.server_id = server_id,
            other => return Err(unexpected("Connected", &other)),
        }

        tracing::debug!(
            server_id = %conn.server_id,
            app_id = %config.app_id,
            user = %config.user,
            "connected to shuffle server",
        );
        Ok(conn)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    // ---

    pub async fn send(&mut self, msg: &ClientMsg) -> Result<()> {
        with_timeout("send", self.timeout, write_control(&mut self.stream, msg)).await
    }

    pub async fn send_records(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        with_timeout("send records", self.timeout, write_frame(&mut self.stream, kind, payload))
            .await
    }

    /// Next reply; `Error` replies come back as `Err`.
    pub async fn recv(&mut self) -> Result<ServerMsg> {
        with_timeout("recv", self.timeout, read_control::<_, ServerMsg>(&mut self.stream))
            .await?
            .into_result()
    }

    /// Receive and require exactly `expected`.
    pub async fn expect(&mut self, expected: ServerMsg) -> Result<()> {
        let got = self.recv().await?;
        if got == expected {
            Ok(())
        } else {
            Err(unexpected(&format!("{expected:?}"), &got))
        }
    }

    // ---

    /// Announce an upload and wait for the server to accept it.
    pub async fn start_upload(
        &mut self,
        app_map_id: &AppMapId,
        attempt_id: i64,
        num_splits: u16,
    ) -> Result<()> {
        // ---
        self.send(&ClientMsg::StartUpload {
            app_map_id: app_map_id.clone(),
            attempt_id,
            num_splits,
        })
        .await?;
        self.expect(ServerMsg::UploadStarted).await
    }

    /// End the current upload.  Waits for the acknowledgment only when
    /// `ack` is set.
    pub async fn finish_upload(&mut self, ack: bool) -> Result<()> {
        // ---
        self.send(&ClientMsg::FinishUpload { ack }).await?;
        if ack {
            self.expect(ServerMsg::FinishUploadAck).await?;
        }
        Ok(())
    }

    pub async fn commit(&mut self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()> {
        self.send(&ClientMsg::Commit {
            app_map_id: app_map_id.clone(),
            attempt_id,
        })
        .await?;
        self.expect(ServerMsg::Committed).await
    }

    // ---

    /// Say goodbye and shut down the write half.  Errors are reported but the
    /// connection is unusable afterwards either way.
    pub async fn shutdown(&mut self) -> Result<()> {
        // ---
        self.send(&ClientMsg::Close).await?;
        with_timeout("shutdown", self.timeout, async {
            self.stream.shutdown().await.map_err(RssError::from)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| RssError::Timeout { op, after })?
}

fn unexpected(expected: &str, got: &ServerMsg) -> RssError {
    RssError::Transport(format!("expected {expected} reply, got {got:?}"))
}
