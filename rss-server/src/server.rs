//! Accept loop and background housekeeping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

// ---

use rss_domain::{Result, ServerDetail, ServiceRegistry};

// ---

use super::collector::CompactionHandle;
use super::upload_handler::{handle_connection, ServerContext};

// ---------------------------------------------------------------------------
// CleanupPolicy
// ---------------------------------------------------------------------------

/// Idle-application teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Applications with no activity for this long are removed.
    pub retention: Duration,

    /// How often to look.
    pub interval: Duration,
}

// ---------------------------------------------------------------------------
// ShutdownHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// ShuffleServer
// ---------------------------------------------------------------------------

pub struct ShuffleServer {
    // ---
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    cleanup: Option<CleanupPolicy>,
    compaction: Option<CompactionHandle>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

// ---

impl ShuffleServer {
    // ---
    pub async fn bind(addr: SocketAddr, ctx: Arc<ServerContext>) -> Result<Self> {
        // ---
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = watch::channel(false);
        tracing::info!(
            server_id = %ctx.server_id,
            addr = %listener.local_addr()?,
            "shuffle server listening",
        );
        Ok(Self {
            listener,
            ctx,
            cleanup: None,
            compaction: None,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    /// Enable periodic teardown of idle applications.
    pub fn with_cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup = Some(policy);
        self
    }

    /// Where to ask for a major checkpoint after releasing memory.
    pub fn with_compaction(mut self, compaction: CompactionHandle) -> Self {
        self.compaction = Some(compaction);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Announce this server under `data_center`/`cluster`.  A wildcard bind
    /// address is advertised as the host name.
    pub fn register(
        &self,
        registry: &dyn ServiceRegistry,
        data_center: &str,
        cluster: &str,
    ) -> Result<ServerDetail> {
        // ---
        let addr = self.local_addr()?;
        let host = if addr.ip().is_unspecified() {
            sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
        } else {
            addr.ip().to_string()
        };
        let detail = ServerDetail {
            server_id: self.ctx.server_id.clone(),
            host,
            port: addr.port(),
        };
        registry.register_server(data_center, cluster, detail.clone())?;
        tracing::info!(
            %data_center,
            %cluster,
            server_id = %detail.server_id,
            host = %detail.host,
            port = detail.port,
            "server registered",
        );
        Ok(detail)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    // ---

    /// Serve until [`ShutdownHandle::trigger`].  Open connections are
    /// aborted on the way out.
    pub async fn run(self) -> Result<()> {
        // ---
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        let cleanup_task = self.cleanup.map(|policy| {
            tokio::spawn(run_cleanup(
                Arc::clone(&self.ctx),
                policy,
                self.compaction.clone(),
                self.shutdown_tx.subscribe(),
            ))
        });

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "set_nodelay failed");
                    }
                    let ctx = Arc::clone(&self.ctx);
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(ctx, stream, peer.to_string()).await {
                            tracing::warn!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "connection task panicked");
                        }
                    }
                }
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!(open = connections.len(), "shuffle server shutting down");
        connections.shutdown().await;
        if let Some(task) = cleanup_task {
            task.abort();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Application cleanup
// ---------------------------------------------------------------------------

async fn run_cleanup(
    ctx: Arc<ServerContext>,
    policy: CleanupPolicy,
    compaction: Option<CompactionHandle>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // ---
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                expire_idle_applications(&ctx, policy.retention, compaction.as_ref());
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => return,
        }
    }
}

/// One cleanup pass.  Returns the expired application ids.
pub fn expire_idle_applications(
    ctx: &ServerContext,
    retention: Duration,
    compaction: Option<&CompactionHandle>,
) -> Vec<String> {
    // ---
    let expired = ctx.registry.expire_idle_applications(retention);
    if expired.is_empty() {
        return expired;
    }

    let released: u64 = expired
        .iter()
        .map(|app_id| ctx.sink.drop_application(app_id))
        .sum();
    tracing::info!(
        apps = expired.len(),
        released_bytes = released,
        retention_secs = retention.as_secs(),
        "expired idle applications",
    );

    if let Some(compaction) = compaction {
        compaction.request_major();
    }
    expired
}
