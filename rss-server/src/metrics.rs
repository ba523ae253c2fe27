//! Server metrics.
//!
//! Everything is atomics; a single [`ServerMetrics`] is built in `main` and
//! shared by `Arc`.  Updates are also emitted as `tracing` events under the
//! `metrics` target so a log pipeline can pick them up without a metrics
//! backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

// ---

use rss_domain::RssError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Exception tag for failures inside the memory monitor.
pub const TAG_MEMORY_MONITOR: &str = "MemoryMonitor";

/// Exception tag for failures inside a connection handler.
pub const TAG_UPLOAD_HANDLER: &str = "UploadHandler";

/// Upper bound of the collection-duration histograms.
pub const GC_HISTOGRAM_MAX: Duration = Duration::from_secs(10);

/// Bucket count of the collection-duration histograms.
pub const GC_HISTOGRAM_BUCKETS: usize = 50;

// ---------------------------------------------------------------------------
// Gauge
// ---------------------------------------------------------------------------

/// Last-value gauge holding an `f64`.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    bits: AtomicU64,
}

impl Gauge {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
        tracing::debug!(target: "metrics", metric = self.name, value, "gauge");
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Counter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn add(&self, n: u64) {
        let value = self.value.fetch_add(n, Ordering::Relaxed) + n;
        tracing::trace!(target: "metrics", metric = self.name, value, "counter");
    }

    pub fn incr(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// DurationHistogram
// ---------------------------------------------------------------------------

/// Histogram with equal-width buckets over `[0, max]` plus one overflow
/// bucket for anything above `max`.
#[derive(Debug)]
pub struct DurationHistogram {
    // ---
    name: &'static str,
    bucket_width: Duration,

    /// `buckets + 1` slots; the last one is overflow.
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

// ---

impl DurationHistogram {
    // ---
    pub fn linear(name: &'static str, max: Duration, buckets: usize) -> Self {
        // ---
        let buckets = buckets.max(1);
        let bucket_width = (max / buckets as u32).max(Duration::from_micros(1));
        Self {
            name,
            bucket_width,
            counts: (0..=buckets).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, duration: Duration) {
        // ---
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
        self.counts[self.bucket_index(duration)].fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            target: "metrics",
            metric = self.name,
            value_ms = duration.as_secs_f64() * 1000.0,
            "histogram",
        );
    }

    /// Bucket `i` covers `[i * width, (i + 1) * width)`.
    fn bucket_index(&self, duration: Duration) -> usize {
        let overflow = self.counts.len() - 1;
        let idx = duration.as_nanos() / self.bucket_width.as_nanos();
        usize::try_from(idx).map_or(overflow, |i| i.min(overflow))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us.load(Ordering::Relaxed))
    }

    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}

// ---------------------------------------------------------------------------
// ServerMetrics
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ServerMetrics {
    // ---
    /// Heap occupancy observed at the last major checkpoint.
    pub heap_memory_percentage: Gauge,
    pub gc_duration: DurationHistogram,
    pub major_gc_duration: DurationHistogram,

    pub uploads_started: Counter,
    pub uploads_finished: Counter,
    pub uploads_rejected: Counter,
    pub attempts_committed: Counter,
    pub records_received: Counter,
    pub bytes_received: Counter,

    exceptions: DashMap<&'static str, u64>,
}

// ---

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    // ---
    pub fn new() -> Self {
        Self {
            heap_memory_percentage: Gauge::new("heapMemoryPercentage"),
            gc_duration: DurationHistogram::linear(
                "gcDuration",
                GC_HISTOGRAM_MAX,
                GC_HISTOGRAM_BUCKETS,
            ),
            major_gc_duration: DurationHistogram::linear(
                "majorGCDuration",
                GC_HISTOGRAM_MAX,
                GC_HISTOGRAM_BUCKETS,
            ),
            uploads_started: Counter::new("uploadsStarted"),
            uploads_finished: Counter::new("uploadsFinished"),
            uploads_rejected: Counter::new("uploadsRejected"),
            attempts_committed: Counter::new("attemptsCommitted"),
            records_received: Counter::new("recordsReceived"),
            bytes_received: Counter::new("bytesReceived"),
            exceptions: DashMap::new(),
        }
    }

    /// Report a failure to the exception tracker under `tag`.
    pub fn add_exception(&self, err: &RssError, tag: &'static str) {
        // ---
        let count = {
            let mut entry = self.exceptions.entry(tag).or_insert(0);
            *entry += 1;
            *entry
        };
        tracing::warn!(target: "metrics", tag, count, error = %err, "exception");
    }

    pub fn exception_count(&self, tag: &str) -> u64 {
        self.exceptions.get(tag).map(|c| *c).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
