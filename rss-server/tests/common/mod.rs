//! In-process server harness for the end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::task::JoinHandle;

// ---

use rss_client::WriteClientConfig;
use rss_domain::{InMemoryServiceRegistry, Result, TaskAttemptRegistry};
use rss_server::{
    // ---
    AdmissionConfig,
    AdmissionController,
    CollectorSource,
    CollectorSourcePtr,
    InMemoryRecordSink,
    LowMemoryListener,
    ManualHeapSource,
    MemoryMonitor,
    ServerContext,
    ServerMetrics,
    ShuffleServer,
    ShutdownHandle,
    MAJOR_ACTION,
};

pub const TEST_DATA_CENTER: &str = "test-dc";
pub const TEST_CLUSTER: &str = "test-cluster";

// ---------------------------------------------------------------------------
// TestServer
// ---------------------------------------------------------------------------

pub struct TestServer {
    // ---
    pub addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
    pub sink: Arc<InMemoryRecordSink>,
    pub heap: Arc<ManualHeapSource>,
    pub old_gen: CollectorSourcePtr,
    pub services: InMemoryServiceRegistry,
    listener: LowMemoryListener,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<()>>,
}

#[derive(Debug, Clone, Copy)]
pub struct TestOptions {
    pub threshold_percentage: u64,
    pub pressure_hold: Duration,
    pub max_inflight_uploads: usize,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            threshold_percentage: 80,
            pressure_hold: Duration::from_secs(60),
            max_inflight_uploads: 0,
        }
    }
}

impl TestServer {
    // ---
    pub async fn start() -> Self {
        Self::start_with(TestOptions::default()).await
    }

    pub async fn start_with(opts: TestOptions) -> Self {
        // ---
        let metrics = Arc::new(ServerMetrics::new());
        let registry = Arc::new(TaskAttemptRegistry::new());
        let heap = Arc::new(ManualHeapSource::new(10, 100));
        let old_gen: CollectorSourcePtr = Arc::new(CollectorSource::new("old"));

        let admission = AdmissionController::new(
            AdmissionConfig {
                pressure_hold: opts.pressure_hold,
                max_inflight_uploads: opts.max_inflight_uploads,
            },
            Arc::clone(&registry),
            Arc::clone(&metrics),
        );

        let monitor = MemoryMonitor::new(
            vec![Arc::clone(&old_gen)],
            Arc::clone(&heap) as _,
            Arc::clone(&metrics),
        );
        let on_pressure = admission.clone();
        let listener = monitor.add_low_memory_listener(opts.threshold_percentage, move |s| {
            on_pressure.on_low_memory(&s);
        });

        let sink = Arc::new(InMemoryRecordSink::new());
        let ctx = Arc::new(ServerContext {
            server_id: "test-server".into(),
            registry,
            admission,
            sink: Arc::clone(&sink) as _,
            metrics,
            network_timeout: Duration::from_secs(5),
        });

        let server = ShuffleServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&ctx))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let services = InMemoryServiceRegistry::new();
        server
            .register(&services, TEST_DATA_CENTER, TEST_CLUSTER)
            .unwrap();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        Self {
            addr,
            ctx,
            sink,
            heap,
            old_gen,
            services,
            listener,
            shutdown,
            task,
        }
    }

    pub fn client_config(&self, app_id: &str) -> WriteClientConfig {
        WriteClientConfig::new(self.addr.ip().to_string(), self.addr.port(), "tester", app_id, "0")
            .with_timeout(Duration::from_secs(5))
            .with_finish_upload_ack(true)
    }

    /// Publish a major checkpoint with heap occupancy at `percent` and wait
    /// until the admission controller has seen the resulting signal.
    pub async fn raise_memory_pressure(&self, percent: u64) {
        // ---
        self.heap.set_used_percentage(percent);
        self.old_gen
            .publish(MAJOR_ACTION, Duration::ZERO, Duration::from_millis(3));

        for _ in 0..200 {
            if self.ctx.admission.is_under_pressure() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("low-memory signal never reached admission control");
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        self.task.await.unwrap().unwrap();
        self.listener.shutdown();
    }
}
