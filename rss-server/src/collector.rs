//! Reclamation checkpoints.
//!
//! The memory monitor reacts to collection events published by one or more
//! [`CollectorSource`]s.  Rust has no garbage collector to listen to, so the
//! server runs a [`PeriodicSampler`] that publishes checkpoints instead:
//!
//! - every tick is a *minor* checkpoint on the `young` source;
//! - every `major_every`-th tick, and every explicit compaction request, is
//!   a *major* checkpoint on the `old` source.
//!
//! A checkpoint's duration is how late the sampler ran relative to when it
//! was due, i.e. how long the runtime stalled before it could observe
//! memory.
//!
//! ```text
//!   tokio::interval ─┐
//!                    ├─► PeriodicSampler ──► young (minor) ─┐
//!   CompactionHandle ┘                   └─► old   (major) ─┴─► MemoryMonitor listeners
//! ```

use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MINOR_ACTION: &str = "end of minor GC";
pub const MAJOR_ACTION: &str = "end of major GC";

/// Events buffered per subscriber before it starts lagging.
const SOURCE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// CollectionEvent
// ---------------------------------------------------------------------------

/// One completed reclamation, as reported by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEvent {
    // ---
    /// Name of the source that reported it.
    pub source: String,

    /// Free-form action text; anything mentioning "major" is a major
    /// collection.
    pub action: String,

    /// Start time relative to the reporting sampler's start.
    pub start: Duration,
    pub duration: Duration,
}

impl CollectionEvent {
    pub fn is_major(&self) -> bool {
        self.action.to_lowercase().contains("major")
    }
}

// ---------------------------------------------------------------------------
// CollectorSource
// ---------------------------------------------------------------------------

/// A named publisher of collection events.  Every subscriber sees every
/// event published after it subscribed.
#[derive(Debug)]
pub struct CollectorSource {
    name: String,
    tx: broadcast::Sender<CollectionEvent>,
}

impl CollectorSource {
    // ---
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(SOURCE_CAPACITY);
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event.  Returns how many subscribers received it.
    pub fn publish(&self, action: &str, start: Duration, duration: Duration) -> usize {
        let event = CollectionEvent {
            source: self.name.clone(),
            action: action.to_string(),
            start,
            duration,
        };
        self.tx.send(event).unwrap_or(0)
    }
}

pub type CollectorSourcePtr = Arc<CollectorSource>;

// ---------------------------------------------------------------------------
// CompactionHandle
// ---------------------------------------------------------------------------

/// Requests an out-of-band major checkpoint, e.g. after a large release of
/// buffered data.  Requests made while one is already pending coalesce.
#[derive(Debug, Clone)]
pub struct CompactionHandle {
    tx: mpsc::Sender<Instant>,
}

impl CompactionHandle {
    pub fn request_major(&self) {
        if self.tx.try_send(Instant::now()).is_err() {
            tracing::trace!("compaction request coalesced");
        }
    }
}

// ---------------------------------------------------------------------------
// PeriodicSampler
// ---------------------------------------------------------------------------

pub struct PeriodicSampler {
    // ---
    young: CollectorSourcePtr,
    old: CollectorSourcePtr,
    interval: Duration,
    major_every: u32,
    compaction_tx: mpsc::Sender<Instant>,
    compaction_rx: mpsc::Receiver<Instant>,
}

// ---

impl PeriodicSampler {
    // ---
    pub fn new(interval: Duration, major_every: u32) -> Self {
        let (compaction_tx, compaction_rx) = mpsc::channel(1);
        Self {
            young: Arc::new(CollectorSource::new("young")),
            old: Arc::new(CollectorSource::new("old")),
            interval,
            major_every: major_every.max(1),
            compaction_tx,
            compaction_rx,
        }
    }

    /// Sources to hand to the memory monitor.  Subscribe before
    /// [`spawn`](Self::spawn) to see the first checkpoint.
    pub fn sources(&self) -> Vec<CollectorSourcePtr> {
        vec![Arc::clone(&self.young), Arc::clone(&self.old)]
    }

    pub fn compaction_handle(&self) -> CompactionHandle {
        CompactionHandle {
            tx: self.compaction_tx.clone(),
        }
    }

    pub fn spawn(self) -> SamplerHandle {
        let compaction = self.compaction_handle();
        let task = tokio::spawn(self.run());
        SamplerHandle { compaction, task }
    }

    // ---

    async fn run(mut self) {
        // ---
        let origin = Instant::now();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; it is not a checkpoint.
        ticker.tick().await;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            major_every = self.major_every,
            "reclamation sampler started",
        );

        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                due = ticker.tick() => {
                    ticks += 1;
                    let start = due.saturating_duration_since(origin);
                    let stall = Instant::now().saturating_duration_since(due);

                    self.young.publish(MINOR_ACTION, start, stall);
                    if ticks % u64::from(self.major_every) == 0 {
                        self.old.publish(MAJOR_ACTION, start, stall);
                    }
                }
                Some(requested) = self.compaction_rx.recv() => {
                    let start = requested.saturating_duration_since(origin);
                    let waited = requested.elapsed();
                    tracing::debug!(waited_ms = waited.as_millis() as u64, "compaction checkpoint");
                    self.old.publish(MAJOR_ACTION, start, waited);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SamplerHandle
// ---------------------------------------------------------------------------

pub struct SamplerHandle {
    compaction: CompactionHandle,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn compaction(&self) -> CompactionHandle {
        self.compaction.clone()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
