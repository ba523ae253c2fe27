//! Write clients for the remote shuffle service.
//!
//! A map task obtains a client from a [`WriteClientFactory`], then drives it
//! through [`RecordUploadClient`]: connect, start-upload, records,
//! finish-upload, close.  The factory picks the variant from the
//! configuration:
//!
//! - [`PlainRecordWriteClient`]      — one frame per record, sent immediately
//! - [`CompressedRecordWriteClient`] — records buffered and shipped as LZ4 blocks
//!
//! [`CommitClient`] is the driver-side counterpart that commits attempts.

mod commit;
mod compressed;
mod connection;
mod factory;
mod lifecycle;
mod plain;

#[cfg(test)]
mod test_support;

// --- connection
pub use connection::{ConnStream, ConnStreamPtr, ServerConnection};

// --- clients
pub use compressed::CompressedRecordWriteClient;
pub use plain::PlainRecordWriteClient;

// --- factory
pub use factory::{resolve_server, UnpooledWriteClientFactory, WriteClient, WriteClientFactory};

// --- commit
pub use commit::CommitClient;

// Re-exported so callers need only this crate to drive an upload.
pub use rss_domain::{AppMapId, RecordUploadClient, WriteClientConfig};
