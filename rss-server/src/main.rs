//! Remote shuffle service upload server.
//!
//! Usage:
//!   rss-server --bind 0.0.0.0:19190 --low-memory-percentage 90 --max-inflight-uploads 512

use std::sync::Arc;

// ---

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ---

use rss_domain::{InMemoryServiceRegistry, TaskAttemptRegistry};
use rss_server::{
    // ---
    AdmissionConfig,
    AdmissionController,
    CleanupPolicy,
    Config,
    InMemoryRecordSink,
    MemoryMonitor,
    PeriodicSampler,
    ProcessHeapSource,
    ServerContext,
    ServerMetrics,
    ShuffleServer,
};

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---

    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    let server_id = cfg
        .server_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %server_id,
        data_center = %cfg.data_center,
        cluster = %cfg.cluster,
        "rss-server starting",
    );

    let metrics = Arc::new(ServerMetrics::new());
    let registry = Arc::new(TaskAttemptRegistry::new());

    // Reclamation checkpoints feed the memory monitor, which feeds admission.
    let heap = Arc::new(ProcessHeapSource::new(cfg.memory_ceiling_bytes)?);
    let sampler = PeriodicSampler::new(cfg.sample_interval(), cfg.major_every);
    let monitor = MemoryMonitor::new(sampler.sources(), heap, Arc::clone(&metrics));

    let admission = AdmissionController::new(
        AdmissionConfig {
            pressure_hold: cfg.pressure_hold(),
            max_inflight_uploads: cfg.max_inflight_uploads,
        },
        Arc::clone(&registry),
        Arc::clone(&metrics),
    );

    let on_pressure = admission.clone();
    let mut listener = monitor.add_low_memory_listener(cfg.low_memory_percentage, move |sample| {
        on_pressure.on_low_memory(&sample);
    });
    let sampler = sampler.spawn();

    let ctx = Arc::new(ServerContext {
        server_id,
        registry,
        admission,
        sink: Arc::new(InMemoryRecordSink::new()),
        metrics,
        network_timeout: cfg.network_timeout(),
    });

    let server = ShuffleServer::bind(cfg.bind, ctx)
        .await?
        .with_cleanup(CleanupPolicy {
            retention: cfg.app_retention(),
            interval: cfg.cleanup_interval(),
        })
        .with_compaction(sampler.compaction());
    let services = InMemoryServiceRegistry::new();
    server.register(&services, &cfg.data_center, &cfg.cluster)?;
    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("shutting down");
            signal.map_err(anyhow::Error::from)
        }
        failure = listener.failure() => match failure {
            Some(e) => {
                error!(error = %e, "memory monitor failed; shutting down");
                Err(e.into())
            }
            None => {
                error!("memory monitor stopped; shutting down");
                Err(anyhow::anyhow!("memory monitor stopped"))
            }
        },
    };

    shutdown.trigger();
    match server_task.await {
        Ok(Err(e)) => error!(error = %e, "server loop failed"),
        Err(e) => error!(error = %e, "server task failed"),
        Ok(Ok(())) => {}
    }
    listener.shutdown();
    sampler.shutdown();

    outcome
}
