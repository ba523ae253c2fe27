//! Upload server for the remote shuffle service.
//!
//! Accepts write-client connections, drives each attempt through the
//! task-attempt state machine, and refuses new uploads while the process
//! is short of memory.
//!
//! # Structure
//!
//! - [`config`]         — [`Config`] command line
//! - [`metrics`]        — gauges, counters and histograms
//! - [`collector`]      — reclamation checkpoints ([`PeriodicSampler`])
//! - [`memory_monitor`] — [`MemoryMonitor`] and the low-memory signal
//! - [`backpressure`]   — [`AdmissionController`]
//! - [`record_sink`]    — [`RecordSink`] where uploaded records land
//! - [`upload_handler`] — per-connection protocol driver
//! - [`server`]         — [`ShuffleServer`] accept loop and cleanup

mod backpressure;
mod collector;
mod config;
mod memory_monitor;
pub mod metrics;
mod record_sink;
mod server;
mod upload_handler;

// --- config
pub use config::Config;

// --- metrics
pub use metrics::{Counter, DurationHistogram, Gauge, ServerMetrics};

// --- collector
pub use collector::{
    // ---
    CollectionEvent,
    CollectorSource,
    CollectorSourcePtr,
    CompactionHandle,
    PeriodicSampler,
    SamplerHandle,
    MAJOR_ACTION,
    MINOR_ACTION,
};

// --- memory monitor
pub use memory_monitor::{
    // ---
    HeapSample,
    HeapUsage,
    HeapUsageSource,
    HeapUsageSourcePtr,
    LowMemoryListener,
    ManualHeapSource,
    MemoryMonitor,
    ProcessHeapSource,
};

// --- backpressure
pub use backpressure::{AdmissionConfig, AdmissionController, AdmissionRejection, AdmissionStats};

// --- record sink
pub use record_sink::{InMemoryRecordSink, RecordSink, RecordSinkPtr};

// --- connections
pub use server::{expire_idle_applications, CleanupPolicy, ShuffleServer, ShutdownHandle};
pub use upload_handler::{handle_connection, ServerContext};
