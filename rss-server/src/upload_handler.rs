//! Per-connection protocol driver.
//!
//! One [`handle_connection`] task per accepted socket.  The connection must
//! open with `Connect`; after that it may carry any number of uploads (each
//! `StartUpload`, record frames, `FinishUpload`) and commits, until `Close`
//! or EOF.
//!
//! Attempt-level failures (illegal transition, unknown attempt, admission
//! refusal) are answered with an `Error` reply and the connection carries
//! on.  Anything that leaves the byte stream in doubt (bad framing, records
//! outside an upload, a failed append) is answered if possible and then ends
//! the connection.

use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::io::{AsyncRead, AsyncWrite};

// ---

use rss_domain::{AppMapId, Result, RssError, TaskAttempt, TaskAttemptRegistry, TaskAttemptState};
use rss_protocol::{
    // ---
    decode_control,
    frame_records,
    read_frame,
    write_control,
    ClientMsg,
    Frame,
    FrameKind,
    ServerMsg,
    PROTOCOL_VERSION,
};

// ---

use super::backpressure::AdmissionController;
use super::metrics::{ServerMetrics, TAG_UPLOAD_HANDLER};
use super::record_sink::RecordSinkPtr;

// ---------------------------------------------------------------------------
// ServerContext
// ---------------------------------------------------------------------------

/// Everything a connection handler needs, shared by `Arc`.
pub struct ServerContext {
    // ---
    pub server_id: String,
    pub registry: Arc<TaskAttemptRegistry>,
    pub admission: AdmissionController,
    pub sink: RecordSinkPtr,
    pub metrics: Arc<ServerMetrics>,

    /// Bound on writing one reply.
    pub network_timeout: Duration,
}

// ---------------------------------------------------------------------------
// handle_connection
// ---------------------------------------------------------------------------

pub async fn handle_connection<S>(ctx: Arc<ServerContext>, stream: S, peer: String) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    let mut handler = UploadHandler {
        ctx,
        stream,
        peer,
        session: None,
        current: None,
    };
    let result = handler.run().await;
    handler.on_disconnect();
    result
}

// ---------------------------------------------------------------------------
// UploadHandler
// ---------------------------------------------------------------------------

/// Identity sent in `Connect`.
#[derive(Debug)]
struct Session {
    user: String,
    app_id: String,
    app_attempt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct UploadHandler<S> {
    // ---
    ctx: Arc<ServerContext>,
    stream: S,
    peer: String,
    session: Option<Session>,

    /// Attempt between start-upload and finish-upload on this connection.
    current: Option<Arc<TaskAttempt>>,
}

// ---

impl<S> UploadHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---
    async fn run(&mut self) -> Result<()> {
        // ---
        loop {
            let Some(frame) = read_frame(&mut self.stream).await? else {
                tracing::debug!(peer = %self.peer, "peer closed connection");
                return Ok(());
            };

            match frame.kind {
                FrameKind::Control => {
                    let msg = match decode_control::<ClientMsg>(&frame) {
                        Ok(msg) => msg,
                        Err(e) => return self.fail(e).await,
                    };
                    if self.on_control(msg).await? == Flow::Close {
                        tracing::debug!(peer = %self.peer, "client said goodbye");
                        return Ok(());
                    }
                }
                FrameKind::Records | FrameKind::CompressedRecords => {
                    self.on_records(&frame).await?;
                }
            }
        }
    }

    // ---

    async fn on_control(&mut self, msg: ClientMsg) -> Result<Flow> {
        // ---
        if self.session.is_none() && !matches!(msg, ClientMsg::Connect { .. }) {
            return self
                .fail(RssError::ClientState("first message must be Connect".into()))
                .await
                .map(|()| Flow::Close);
        }

        match msg {
            ClientMsg::Connect {
                user,
                app_id,
                app_attempt,
                protocol_version,
            } => {
                self.on_connect(user, app_id, app_attempt, protocol_version)
                    .await?
            }
            ClientMsg::StartUpload {
                app_map_id,
                attempt_id,
                num_splits,
            } => self.on_start_upload(app_map_id, attempt_id, num_splits).await?,
            ClientMsg::FinishUpload { ack } => self.on_finish_upload(ack).await?,
            ClientMsg::Commit {
                app_map_id,
                attempt_id,
            } => self.on_commit(app_map_id, attempt_id).await?,
            ClientMsg::Close => return Ok(Flow::Close),
        }
        Ok(Flow::Continue)
    }

    async fn on_connect(
        &mut self,
        user: String,
        app_id: String,
        app_attempt: String,
        protocol_version: u8,
    ) -> Result<()> {
        // ---
        if self.session.is_some() {
            return self
                .fail(RssError::ClientState("duplicate Connect".into()))
                .await;
        }
        if protocol_version != PROTOCOL_VERSION {
            return self
                .fail(RssError::ClientState(format!(
                    "protocol version {protocol_version} not supported, expected {PROTOCOL_VERSION}"
                )))
                .await;
        }

        tracing::info!(
            peer = %self.peer,
            %user,
            %app_id,
            %app_attempt,
            "client connected",
        );
        self.session = Some(Session {
            user,
            app_id,
            app_attempt,
        });
        let server_id = self.ctx.server_id.clone();
        self.reply(ServerMsg::Connected { server_id }).await
    }

    async fn on_start_upload(
        &mut self,
        app_map_id: AppMapId,
        attempt_id: i64,
        num_splits: u16,
    ) -> Result<()> {
        // ---
        if let Some(current) = &self.current {
            let err = RssError::ClientState(format!(
                "upload of {} attempt {} still in progress",
                current.app_map_id(),
                current.attempt_id()
            ));
            return self.reply_error(&err).await;
        }
        if let Err(e) = self.check_application(&app_map_id) {
            return self.reply_error(&e).await;
        }

        // A start the state machine would refuse anyway is answered as such,
        // whatever the memory situation.
        if let Ok(existing) = self.ctx.registry.get(&app_map_id, attempt_id) {
            let current = existing.state();
            if current != TaskAttemptState::NotStarted {
                let err = RssError::InvalidState {
                    app_map_id,
                    attempt_id,
                    current,
                    target: TaskAttemptState::StartUpload,
                };
                tracing::warn!(peer = %self.peer, error = %err, "start-upload rejected");
                return self.reply_error(&err).await;
            }
        }

        if let Err(rejection) = self.ctx.admission.try_admit_upload() {
            tracing::warn!(
                peer = %self.peer,
                %app_map_id,
                attempt_id,
                reason = %rejection,
                retry_after_ms = rejection.retry_after_ms(),
                "start-upload refused",
            );
            return self.reply_error(&rejection.into()).await;
        }

        let attempt = self.ctx.registry.get_or_create(&app_map_id, attempt_id);
        if let Err(e) = attempt.mark_start_upload() {
            tracing::warn!(peer = %self.peer, error = %e, "start-upload rejected");
            return self.reply_error(&e).await;
        }

        self.ctx.metrics.uploads_started.incr();
        tracing::info!(peer = %self.peer, %app_map_id, attempt_id, num_splits, "upload started");
        self.current = Some(attempt);
        self.reply(ServerMsg::UploadStarted).await
    }

    async fn on_finish_upload(&mut self, ack: bool) -> Result<()> {
        // ---
        let result = match self.current.take() {
            Some(attempt) => attempt.mark_finish_upload().map(|()| attempt),
            None => Err(RssError::ClientState(
                "finish-upload without start-upload".into(),
            )),
        };

        match result {
            Ok(attempt) => {
                self.ctx.metrics.uploads_finished.incr();
                tracing::info!(
                    peer = %self.peer,
                    app_map_id = %attempt.app_map_id(),
                    attempt_id = attempt.attempt_id(),
                    ack,
                    "upload finished",
                );
                if ack {
                    self.reply(ServerMsg::FinishUploadAck).await?;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, ack, "finish-upload rejected");
                // Without an ack nobody is waiting for the answer.
                if ack {
                    self.reply_error(&e).await?;
                }
                Ok(())
            }
        }
    }

    async fn on_commit(&mut self, app_map_id: AppMapId, attempt_id: i64) -> Result<()> {
        // ---
        let result = self
            .check_application(&app_map_id)
            .and_then(|()| self.ctx.registry.get(&app_map_id, attempt_id))
            .and_then(|attempt| attempt.mark_committed())
            .and_then(|()| self.ctx.sink.commit(&app_map_id, attempt_id));

        match result {
            Ok(()) => {
                self.ctx.metrics.attempts_committed.incr();
                tracing::info!(peer = %self.peer, %app_map_id, attempt_id, "attempt committed");
                self.reply(ServerMsg::Committed).await
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "commit rejected");
                self.reply_error(&e).await
            }
        }
    }

    // ---

    async fn on_records(&mut self, frame: &Frame) -> Result<()> {
        // ---
        let Some(attempt) = self.current.clone() else {
            return self
                .fail(RssError::ClientState(
                    "records received outside an upload".into(),
                ))
                .await;
        };

        let records = match frame_records(frame) {
            Ok(records) => records,
            Err(e) => return self.fail(e).await,
        };
        let count = records.len() as u64;
        let bytes: u64 = records
            .iter()
            .map(|r| (r.key.len() + r.value.len()) as u64)
            .sum();

        // Record frames keep the application alive for idle expiry.
        self.ctx
            .registry
            .record_activity(&attempt.app_map_id().app_id);

        if let Err(e) = self
            .ctx
            .sink
            .append(attempt.app_map_id(), attempt.attempt_id(), records)
        {
            self.ctx.metrics.add_exception(&e, TAG_UPLOAD_HANDLER);
            return self.fail(e).await;
        }

        self.ctx.metrics.records_received.add(count);
        self.ctx.metrics.bytes_received.add(bytes);
        tracing::trace!(
            app_map_id = %attempt.app_map_id(),
            attempt_id = attempt.attempt_id(),
            count,
            bytes,
            compressed = frame.kind == FrameKind::CompressedRecords,
            "records received",
        );
        Ok(())
    }

    // ---

    /// Attempts named on a connection must belong to its `Connect` application.
    fn check_application(&self, app_map_id: &AppMapId) -> Result<()> {
        // ---
        match &self.session {
            Some(session) if session.app_id != app_map_id.app_id => {
                Err(RssError::ClientState(format!(
                    "connection belongs to application {}, not {}",
                    session.app_id, app_map_id.app_id
                )))
            }
            _ => Ok(()),
        }
    }

    async fn reply(&mut self, msg: ServerMsg) -> Result<()> {
        let after = self.ctx.network_timeout;
        tokio::time::timeout(after, write_control(&mut self.stream, &msg))
            .await
            .map_err(|_| RssError::Timeout { op: "reply", after })?
    }

    async fn reply_error(&mut self, err: &RssError) -> Result<()> {
        self.reply(ServerMsg::from_error(err)).await
    }

    /// Report `err` to the peer if possible, then end the connection with it.
    async fn fail(&mut self, err: RssError) -> Result<()> {
        // ---
        tracing::warn!(peer = %self.peer, error = %err, "closing connection");
        if let Err(e) = self.reply_error(&err).await {
            tracing::debug!(peer = %self.peer, error = %e, "could not deliver error reply");
        }
        Err(err)
    }

    fn on_disconnect(&self) {
        // ---
        if let Some(attempt) = &self.current {
            if attempt.state() == TaskAttemptState::StartUpload {
                tracing::info!(
                    peer = %self.peer,
                    app_map_id = %attempt.app_map_id(),
                    attempt_id = attempt.attempt_id(),
                    "connection ended mid-upload; attempt left in START_UPLOAD",
                );
            }
        }
        if let Some(session) = &self.session {
            tracing::debug!(
                peer = %self.peer,
                app_id = %session.app_id,
                app_attempt = %session.app_attempt,
                user = %session.user,
                "connection closed",
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
