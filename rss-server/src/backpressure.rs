//! Admission control for new uploads.
//!
//! Two independent reasons to refuse a start-upload:
//!
//! - **memory pressure**: a low-memory signal opens a window of
//!   `pressure_hold`; a repeated signal extends it.
//! - **in-flight cap**: too many attempts are already between start-upload
//!   and finish-upload.
//!
//! Finish-upload and commit are never refused, so work already admitted can
//! drain.  Checks are best-effort: concurrent starts may all slip in just as
//! the window opens.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

// ---

use rss_domain::{RssError, TaskAttemptRegistry};

// ---

use super::memory_monitor::HeapSample;
use super::metrics::ServerMetrics;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_RETRY_AFTER_MS: u64 = 100;

// ---------------------------------------------------------------------------
// AdmissionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub pressure_hold: Duration,

    /// `0` disables the cap.
    pub max_inflight_uploads: usize,
}

// ---------------------------------------------------------------------------
// AdmissionRejection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionRejection {
    #[error("memory pressure")]
    MemoryPressure { retry_after_ms: u64 },

    #[error("{inflight} uploads in flight, limit {limit}")]
    TooManyInflight {
        inflight: usize,
        limit: usize,
        retry_after_ms: u64,
    },
}

impl AdmissionRejection {
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            AdmissionRejection::MemoryPressure { retry_after_ms }
            | AdmissionRejection::TooManyInflight { retry_after_ms, .. } => *retry_after_ms,
        }
    }
}

impl From<AdmissionRejection> for RssError {
    fn from(r: AdmissionRejection) -> Self {
        RssError::Overloaded {
            reason: r.to_string(),
            retry_after_ms: r.retry_after_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// AdmissionStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub rejected_pressure: u64,
    pub rejected_inflight: u64,
    pub low_memory_signals: u64,
}

// ---------------------------------------------------------------------------
// AdmissionController
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct AdmissionController {
    inner: Arc<AdmissionState>,
}

#[derive(Debug)]
struct AdmissionState {
    // ---
    config: AdmissionConfig,
    registry: Arc<TaskAttemptRegistry>,
    metrics: Arc<ServerMetrics>,

    /// Time base for `pressure_until_ms`.
    origin: Instant,

    /// End of the pressure window, in ms since `origin`.  `0` = never.
    pressure_until_ms: AtomicU64,

    admitted: AtomicU64,
    rejected_pressure: AtomicU64,
    rejected_inflight: AtomicU64,
    low_memory_signals: AtomicU64,
}

// ---

impl AdmissionController {
    // ---
    pub fn new(
        config: AdmissionConfig,
        registry: Arc<TaskAttemptRegistry>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(AdmissionState {
                config,
                registry,
                metrics,
                origin: Instant::now(),
                pressure_until_ms: AtomicU64::new(0),
                admitted: AtomicU64::new(0),
                rejected_pressure: AtomicU64::new(0),
                rejected_inflight: AtomicU64::new(0),
                low_memory_signals: AtomicU64::new(0),
            }),
        }
    }

    // ---

    /// Low-memory callback: open (or extend) the pressure window.
    pub fn on_low_memory(&self, sample: &HeapSample) {
        // ---
        let s = &self.inner;
        let hold_ms = duration_ms(s.config.pressure_hold);
        let until = self.now_ms().saturating_add(hold_ms);
        s.pressure_until_ms.fetch_max(until, Ordering::AcqRel);
        s.low_memory_signals.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            used_percentage = sample.used_percentage,
            used_bytes = sample.used_bytes,
            max_bytes = sample.max_bytes,
            hold_ms,
            "low memory: refusing new uploads",
        );
    }

    pub fn is_under_pressure(&self) -> bool {
        self.pressure_remaining_ms() > 0
    }

    /// Decide on a new start-upload.
    pub fn try_admit_upload(&self) -> Result<(), AdmissionRejection> {
        // ---
        let s = &self.inner;

        let remaining = self.pressure_remaining_ms();
        if remaining > 0 {
            s.rejected_pressure.fetch_add(1, Ordering::Relaxed);
            s.metrics.uploads_rejected.incr();
            return Err(AdmissionRejection::MemoryPressure {
                retry_after_ms: remaining,
            });
        }

        let limit = s.config.max_inflight_uploads;
        if limit > 0 {
            let inflight = s.registry.in_flight_uploads();
            if inflight >= limit {
                s.rejected_inflight.fetch_add(1, Ordering::Relaxed);
                s.metrics.uploads_rejected.incr();
                return Err(AdmissionRejection::TooManyInflight {
                    inflight,
                    limit,
                    retry_after_ms: DEFAULT_RETRY_AFTER_MS,
                });
            }
        }

        s.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> AdmissionStats {
        let s = &self.inner;
        AdmissionStats {
            admitted: s.admitted.load(Ordering::Relaxed),
            rejected_pressure: s.rejected_pressure.load(Ordering::Relaxed),
            rejected_inflight: s.rejected_inflight.load(Ordering::Relaxed),
            low_memory_signals: s.low_memory_signals.load(Ordering::Relaxed),
        }
    }

    // ---

    fn pressure_remaining_ms(&self) -> u64 {
        let until = self.inner.pressure_until_ms.load(Ordering::Acquire);
        until.saturating_sub(self.now_ms())
    }

    fn now_ms(&self) -> u64 {
        duration_ms(self.inner.origin.elapsed())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
