//! Heap-pressure monitor.
//!
//! [`MemoryMonitor::add_low_memory_listener`] attaches a listener to every
//! [`CollectorSource`](crate::collector::CollectorSource).  On each
//! collection event the listener records the duration into `gcDuration`;
//! on a *major* event it also records into `majorGCDuration`, samples heap
//! usage, publishes `heapMemoryPercentage` and, when occupancy is strictly
//! above the threshold, queues the sample for the low-memory callback.
//!
//! ## Tasks
//!
//! ```text
//! CollectorSource(young) ──► notification task ─┐
//! CollectorSource(old)   ──► notification task ─┤ try_send       mpsc(4)
//!                                               └──────────► pressure worker ──► on_low_memory(sample)
//! ```
//!
//! The callback never runs on a notification task.  When the queue is full
//! the new sample is dropped: a pending sample already carries the signal.
//!
//! A failed heap query is fatal.  It is logged, counted under the
//! `MemoryMonitor` exception tag, and reported through
//! [`LowMemoryListener::failure`]; the notification task then exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

// ---

use sysinfo::{Pid, System};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ---

use rss_domain::{Result, RssError};

// ---

use super::collector::{CollectionEvent, CollectorSourcePtr};
use super::metrics::{ServerMetrics, TAG_MEMORY_MONITOR};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Pending low-memory samples per listener.
const PRESSURE_QUEUE_CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// Heap types
// ---------------------------------------------------------------------------

/// Raw usage figures from a [`HeapUsageSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub committed_bytes: u64,
}

/// Usage at one major checkpoint, with occupancy computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSample {
    // ---
    pub used_bytes: u64,
    pub max_bytes: u64,

    /// `used_bytes * 100 / max_bytes`, integer division.
    pub used_percentage: u64,
    pub committed_bytes: u64,
    pub timestamp: SystemTime,
}

impl HeapSample {
    // ---
    pub fn from_usage(usage: HeapUsage, timestamp: SystemTime) -> Result<Self> {
        // ---
        if usage.max_bytes == 0 {
            return Err(RssError::Platform("heap maximum is unknown (0 bytes)".into()));
        }
        let used_percentage =
            (u128::from(usage.used_bytes) * 100 / u128::from(usage.max_bytes)) as u64;
        Ok(Self {
            used_bytes: usage.used_bytes,
            max_bytes: usage.max_bytes,
            used_percentage,
            committed_bytes: usage.committed_bytes,
            timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// HeapUsageSource
// ---------------------------------------------------------------------------

/// Where heap figures come from.
pub trait HeapUsageSource: Send + Sync {
    fn heap_usage(&self) -> Result<HeapUsage>;
}

pub type HeapUsageSourcePtr = Arc<dyn HeapUsageSource>;

// ---

/// This process's resident set against a memory ceiling; virtual size is
/// reported as committed.
pub struct ProcessHeapSource {
    system: Mutex<System>,
    pid: Pid,
    ceiling_bytes: u64,
}

impl ProcessHeapSource {
    // ---
    /// `ceiling_bytes == 0` uses total system memory.
    pub fn new(ceiling_bytes: u64) -> Result<Self> {
        // ---
        let pid = sysinfo::get_current_pid().map_err(|e| RssError::Platform(e.to_string()))?;
        let mut system = System::new();
        let ceiling_bytes = if ceiling_bytes > 0 {
            ceiling_bytes
        } else {
            system.refresh_memory();
            system.total_memory()
        };
        tracing::info!(%pid, ceiling_bytes, "process heap source ready");
        Ok(Self {
            system: Mutex::new(system),
            pid,
            ceiling_bytes,
        })
    }
}

impl HeapUsageSource for ProcessHeapSource {
    fn heap_usage(&self) -> Result<HeapUsage> {
        // ---
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        if !system.refresh_process(self.pid) {
            return Err(RssError::Platform(format!(
                "process {} not visible to sysinfo",
                self.pid
            )));
        }
        let proc = system
            .process(self.pid)
            .ok_or_else(|| RssError::Platform(format!("process {} vanished", self.pid)))?;
        Ok(HeapUsage {
            used_bytes: proc.memory(),
            max_bytes: self.ceiling_bytes,
            committed_bytes: proc.virtual_memory(),
        })
    }
}

// ---

/// Heap figures set by the embedder rather than measured.  Lets tests and
/// embedded deployments drive the monitor deterministically.
#[derive(Debug)]
pub struct ManualHeapSource {
    used_bytes: AtomicU64,
    max_bytes: AtomicU64,
}

impl ManualHeapSource {
    pub fn new(used_bytes: u64, max_bytes: u64) -> Self {
        Self {
            used_bytes: AtomicU64::new(used_bytes),
            max_bytes: AtomicU64::new(max_bytes),
        }
    }

    pub fn set_used(&self, used_bytes: u64) {
        self.used_bytes.store(used_bytes, Ordering::Relaxed);
    }

    /// Convenience for tests: set usage to `percent` of the maximum.
    pub fn set_used_percentage(&self, percent: u64) {
        let max = self.max_bytes.load(Ordering::Relaxed);
        self.set_used(max / 100 * percent);
    }
}

impl HeapUsageSource for ManualHeapSource {
    fn heap_usage(&self) -> Result<HeapUsage> {
        let used_bytes = self.used_bytes.load(Ordering::Relaxed);
        Ok(HeapUsage {
            used_bytes,
            max_bytes: self.max_bytes.load(Ordering::Relaxed),
            committed_bytes: used_bytes,
        })
    }
}

// ---------------------------------------------------------------------------
// PressureListener
// ---------------------------------------------------------------------------

/// The per-registration state shared by that registration's notification
/// tasks.
struct PressureListener {
    // ---
    threshold_percentage: u64,
    heap: HeapUsageSourcePtr,
    metrics: Arc<ServerMetrics>,
    pressure_tx: mpsc::Sender<HeapSample>,
}

impl PressureListener {
    // ---
    /// Handle one collection event.  Returns the sample when it crossed the
    /// threshold.
    fn on_collection(&self, event: &CollectionEvent) -> Result<Option<HeapSample>> {
        // ---
        self.metrics.gc_duration.record(event.duration);
        if !event.is_major() {
            return Ok(None);
        }
        self.metrics.major_gc_duration.record(event.duration);

        let sample = self
            .heap
            .heap_usage()
            .and_then(|usage| HeapSample::from_usage(usage, SystemTime::now()))
            .map_err(|e| {
                tracing::error!(error = %e, "failed to query heap usage");
                self.metrics.add_exception(&e, TAG_MEMORY_MONITOR);
                e
            })?;

        self.metrics
            .heap_memory_percentage
            .set(sample.used_percentage as f64);

        tracing::info!(
            source = %event.source,
            action = %event.action,
            start_ms = event.start.as_millis() as u64,
            duration_ms = event.duration.as_millis() as u64,
            used_bytes = sample.used_bytes,
            max_bytes = sample.max_bytes,
            committed_bytes = sample.committed_bytes,
            used_percentage = sample.used_percentage,
            "major reclamation checkpoint",
        );

        if sample.used_percentage <= self.threshold_percentage {
            return Ok(None);
        }

        tracing::warn!(
            used_percentage = sample.used_percentage,
            threshold = self.threshold_percentage,
            "heap occupancy above low-memory threshold",
        );
        match self.pressure_tx.try_send(sample) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("low-memory signal already pending; coalesced");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("low-memory worker gone; signal dropped");
            }
        }
        Ok(Some(sample))
    }
}

// ---------------------------------------------------------------------------
// MemoryMonitor
// ---------------------------------------------------------------------------

pub struct MemoryMonitor {
    // ---
    sources: Vec<CollectorSourcePtr>,
    heap: HeapUsageSourcePtr,
    metrics: Arc<ServerMetrics>,
}

// ---

impl MemoryMonitor {
    // ---
    pub fn new(
        sources: Vec<CollectorSourcePtr>,
        heap: HeapUsageSourcePtr,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            sources,
            heap,
            metrics,
        }
    }

    /// Invoke `on_low_memory` whenever a major checkpoint finds occupancy
    /// strictly above `threshold_percentage`.
    ///
    /// May be called more than once; each call gets its own notification
    /// task per source and its own worker.  Must be called from within a
    /// tokio runtime.
    pub fn add_low_memory_listener<F>(
        &self,
        threshold_percentage: u64,
        on_low_memory: F,
    ) -> LowMemoryListener
    where
        F: Fn(HeapSample) + Send + Sync + 'static,
    {
        // ---
        let (pressure_tx, mut pressure_rx) = mpsc::channel::<HeapSample>(PRESSURE_QUEUE_CAPACITY);
        let (failure_tx, failure_rx) = mpsc::channel::<RssError>(1);

        let listener = Arc::new(PressureListener {
            threshold_percentage,
            heap: Arc::clone(&self.heap),
            metrics: Arc::clone(&self.metrics),
            pressure_tx,
        });

        let worker = tokio::spawn(async move {
            while let Some(sample) = pressure_rx.recv().await {
                on_low_memory(sample);
            }
        });

        let notifiers = self
            .sources
            .iter()
            .map(|source| {
                let rx = source.subscribe();
                let listener = Arc::clone(&listener);
                let failure_tx = failure_tx.clone();
                let name = source.name().to_string();
                tokio::spawn(async move {
                    if let Err(e) = run_notifications(&listener, rx, &name).await {
                        // Capacity 1: the first failure is the one reported.
                        let _ = failure_tx.try_send(e);
                    }
                })
            })
            .collect();

        tracing::info!(
            threshold_percentage,
            sources = self.sources.len(),
            "low-memory listener registered",
        );

        LowMemoryListener {
            notifiers,
            worker,
            failure_rx,
        }
    }
}

// ---

async fn run_notifications(
    listener: &PressureListener,
    mut rx: broadcast::Receiver<CollectionEvent>,
    source: &str,
) -> Result<()> {
    // ---
    loop {
        match rx.recv().await {
            Ok(event) => {
                listener.on_collection(&event)?;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(source, missed, "memory monitor lagging; events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!(source, "collector source closed");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LowMemoryListener
// ---------------------------------------------------------------------------

/// Handle to one registration's tasks.
pub struct LowMemoryListener {
    notifiers: Vec<JoinHandle<()>>,
    worker: JoinHandle<()>,
    failure_rx: mpsc::Receiver<RssError>,
}

impl LowMemoryListener {
    // ---
    /// Resolves with the first fatal error from any notification task, or
    /// `None` once every task has ended without one.
    pub async fn failure(&mut self) -> Option<RssError> {
        self.failure_rx.recv().await
    }

    pub fn shutdown(self) {
        for task in &self.notifiers {
            task.abort();
        }
        self.worker.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::collector::{CollectorSource, MAJOR_ACTION, MINOR_ACTION};

    const GIB: u64 = 1 << 30;

    /// Replays scripted results, then repeats the last one.
    struct ScriptedHeap {
        script: Mutex<VecDeque<Result<HeapUsage>>>,
    }

    impl ScriptedHeap {
        fn percentages(pcts: &[u64]) -> Self {
            let script = pcts
                .iter()
                .map(|p| {
                    Ok(HeapUsage {
                        used_bytes: GIB / 100 * p,
                        max_bytes: GIB,
                        committed_bytes: GIB,
                    })
                })
                .collect();
            Self {
                script: Mutex::new(script),
            }
        }

        fn failing() -> Self {
            Self {
                script: Mutex::new(VecDeque::from([Err(RssError::Platform(
                    "management interface unavailable".into(),
                ))])),
            }
        }
    }

    impl HeapUsageSource for ScriptedHeap {
        fn heap_usage(&self) -> Result<HeapUsage> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                match script.front().unwrap() {
                    Ok(u) => Ok(*u),
                    Err(e) => Err(RssError::Platform(e.to_string())),
                }
            }
        }
    }

    fn event(action: &str) -> CollectionEvent {
        CollectionEvent {
            source: "test".into(),
            action: action.into(),
            start: Duration::ZERO,
            duration: Duration::from_millis(30),
        }
    }

    fn listener(
        heap: ScriptedHeap,
        threshold: u64,
    ) -> (PressureListener, mpsc::Receiver<HeapSample>, Arc<ServerMetrics>) {
        let metrics = Arc::new(ServerMetrics::new());
        let (tx, rx) = mpsc::channel(PRESSURE_QUEUE_CAPACITY);
        let l = PressureListener {
            threshold_percentage: threshold,
            heap: Arc::new(heap),
            metrics: Arc::clone(&metrics),
            pressure_tx: tx,
        };
        (l, rx, metrics)
    }

    #[test]
    fn used_percentage_is_integer_division() {
        let usage = HeapUsage {
            used_bytes: 799,
            max_bytes: 1000,
            committed_bytes: 0,
        };
        let s = HeapSample::from_usage(usage, SystemTime::now()).unwrap();
        assert_eq!(s.used_percentage, 79);

        let unknown = HeapUsage { max_bytes: 0, ..usage };
        assert!(HeapSample::from_usage(unknown, SystemTime::now()).is_err());
    }

    #[test]
    fn fires_once_for_50_70_95_at_threshold_80() {
        // ---
        let (l, mut rx, metrics) = listener(ScriptedHeap::percentages(&[50, 70, 95]), 80);

        let fired: Vec<bool> = (0..3)
            .map(|_| l.on_collection(&event(MAJOR_ACTION)).unwrap().is_some())
            .collect();
        assert_eq!(fired, vec![false, false, true]);

        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.used_percentage, 95);
        assert!(rx.try_recv().is_err());

        assert_eq!(metrics.heap_memory_percentage.get(), 95.0);
        assert_eq!(metrics.major_gc_duration.count(), 3);
        assert_eq!(metrics.gc_duration.count(), 3);
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let (l, mut rx, _) = listener(ScriptedHeap::percentages(&[80]), 80);
        assert!(l.on_collection(&event(MAJOR_ACTION)).unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn minor_events_never_sample_or_fire() {
        // ---
        let (l, mut rx, metrics) = listener(ScriptedHeap::failing(), 10);
        for _ in 0..5 {
            assert!(l.on_collection(&event(MINOR_ACTION)).unwrap().is_none());
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.gc_duration.count(), 5);
        assert_eq!(metrics.major_gc_duration.count(), 0);
        assert_eq!(metrics.heap_memory_percentage.get(), 0.0);
    }

    #[test]
    fn heap_query_failure_is_fatal_and_counted() {
        let (l, _rx, metrics) = listener(ScriptedHeap::failing(), 80);
        let err = l.on_collection(&event(MAJOR_ACTION)).unwrap_err();
        assert!(matches!(err, RssError::Platform(_)));
        assert_eq!(metrics.exception_count(TAG_MEMORY_MONITOR), 1);
    }

    #[test]
    fn full_queue_coalesces() {
        let (l, mut rx, _) = listener(ScriptedHeap::percentages(&[99]), 50);
        for _ in 0..(PRESSURE_QUEUE_CAPACITY + 3) {
            assert!(l.on_collection(&event(MAJOR_ACTION)).unwrap().is_some());
        }
        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, PRESSURE_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn callback_runs_for_every_registration_via_worker() {
        // ---
        let young = Arc::new(CollectorSource::new("young"));
        let old = Arc::new(CollectorSource::new("old"));
        let heap = Arc::new(ManualHeapSource::new(0, GIB));
        heap.set_used_percentage(90);

        let monitor = MemoryMonitor::new(
            vec![Arc::clone(&young), Arc::clone(&old)],
            heap,
            Arc::new(ServerMetrics::new()),
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());
        let mk = |threshold| {
            let calls = Arc::clone(&calls);
            let done = Arc::clone(&done);
            monitor.add_low_memory_listener(threshold, move |sample| {
                assert_eq!(sample.used_percentage, 90);
                calls.fetch_add(1, Ordering::SeqCst);
                done.notify_one();
            })
        };
        let a = mk(80);
        let b = mk(95);

        young.publish(MINOR_ACTION, Duration::ZERO, Duration::ZERO);
        old.publish(MAJOR_ACTION, Duration::ZERO, Duration::ZERO);

        // Only the 80% registration fires.
        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn failure_surfaces_through_listener_handle() {
        // ---
        let old = Arc::new(CollectorSource::new("old"));
        let metrics = Arc::new(ServerMetrics::new());
        let monitor = MemoryMonitor::new(
            vec![Arc::clone(&old)],
            Arc::new(ScriptedHeap::failing()),
            Arc::clone(&metrics),
        );
        let mut handle = monitor.add_low_memory_listener(80, |_| {});

        old.publish(MAJOR_ACTION, Duration::ZERO, Duration::ZERO);
        let err = tokio::time::timeout(Duration::from_secs(5), handle.failure())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, RssError::Platform(_)));
        assert_eq!(metrics.exception_count(TAG_MEMORY_MONITOR), 1);
    }
}
