//! Wire protocol shared by the shuffle server and its write clients.
//!
//! Both sides import only from `rss_protocol::` so the frame layout and the
//! message set live in one place.
//!
//! - [`framing`]  — fixed header + payload frames, record batches, LZ4 blocks
//! - [`messages`] — [`ClientMsg`], [`ServerMsg`], [`ErrorCode`]

pub mod framing;
mod messages;

// --- framing
pub use framing::{
    // ---
    compress_block,
    decode_control,
    decode_records,
    decompress_block,
    encode_record,
    encoded_len,
    frame_records,
    read_control,
    read_frame,
    write_control,
    write_frame,
    Frame,
    FrameKind,
    Record,
};

// --- messages
pub use messages::{ClientMsg, ErrorCode, ServerMsg, PROTOCOL_VERSION};
