//! Core types and traits for the remote shuffle service.
//!
//! This crate is the vocabulary shared by the server, the wire protocol and
//! the write clients.  It owns the task-attempt state machine and the
//! registry that tracks attempts; everything that touches a socket lives in
//! the other crates.
//!
//! # Structure
//!
//! - [`error`]            — [`RssError`] and [`Result<T>`] alias
//! - [`attempt`]          — [`AppMapId`], [`TaskAttemptState`], [`TaskAttempt`]
//! - [`registry`]         — [`TaskAttemptRegistry`]
//! - [`write_config`]     — [`WriteClientConfig`], [`ShuffleWriteConfig`]
//! - [`upload`]           — [`RecordUploadClient`] capability trait
//! - [`service_registry`] — [`ServiceRegistry`] discovery trait and impls

mod attempt;
mod error;
mod registry;
mod service_registry;
mod upload;
mod write_config;

// --- error
pub use error::{Result, RssError};

// --- attempt
pub use attempt::{AppMapId, TaskAttempt, TaskAttemptState};

// --- registry
pub use registry::{AttemptSnapshot, TaskAttemptRegistry};

// --- write config
pub use write_config::{ShuffleWriteConfig, WriteClientConfig};

// --- upload
pub use upload::RecordUploadClient;

// --- service registry
pub use service_registry::{
    // ---
    InMemoryServiceRegistry,
    ServerDetail,
    ServiceRegistry,
    StandaloneServiceRegistry,
    DEFAULT_CLUSTER,
    DEFAULT_DATA_CENTER,
};
