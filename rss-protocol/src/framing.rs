//! Wire framing for the shuffle upload protocol.
//!
//! Every message on a connection is one frame: a fixed 7-byte header
//! followed by the payload.
//!
//! ```text
//! +-------+-------+-------+-------------------+-----------------------------+
//! | magic | ver   | kind  | payload_len (u32) | payload (payload_len bytes) |
//! | 0x52  | 0x01  |       | big-endian        |                             |
//! +-------+-------+-------+-------------------+-----------------------------+
//!   1 byte  1 byte  1 byte      4 bytes          variable
//!                  ← fixed 7 bytes →
//! ```
//!
//! Payload by kind:
//!
//! - [`FrameKind::Control`] — UTF-8 JSON of a [`ClientMsg`](crate::ClientMsg)
//!   or [`ServerMsg`](crate::ServerMsg).
//! - [`FrameKind::Records`] — one or more encoded records, uncompressed.
//! - [`FrameKind::CompressedRecords`] — the same record encoding, LZ4
//!   compressed with the uncompressed size prepended.
//!
//! Record encoding, repeated until the payload is exhausted:
//!
//! ```text
//! | partition (u32) | key_len (u32) | key | value_len (u32) | value |
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ---

use rss_domain::{Result, RssError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic byte, 'R'.  A mismatch means the reader is out of step with the stream.
pub const MAGIC: u8 = 0x52;

/// Wire format version.  Bump when the fixed header layout changes.
pub const VERSION: u8 = 0x01;

/// Fixed header size in bytes: magic(1) + ver(1) + kind(1) + payload_len(4).
pub const FIXED_HEADER_LEN: usize = 7;

/// Upper bound on a single payload, compressed or not.  Also caps the
/// declared size of a decompressed block.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Per-record header: partition(4) + key_len(4) + value_len(4).
pub const RECORD_OVERHEAD: usize = 12;

// ---------------------------------------------------------------------------
// FrameKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    // ---
    Control,
    Records,
    CompressedRecords,
}

// ---

impl FrameKind {
    // ---
    fn as_u8(self) -> u8 {
        match self {
            FrameKind::Control => 1,
            FrameKind::Records => 2,
            FrameKind::CompressedRecords => 3,
        }
    }

    fn from_u8(b: u8) -> Result<Self> {
        match b {
            1 => Ok(FrameKind::Control),
            2 => Ok(FrameKind::Records),
            3 => Ok(FrameKind::CompressedRecords),
            other => Err(RssError::Transport(format!(
                "framing unknown frame kind 0x{other:02X}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

// ---

/// Write one frame to `stream`.  Does not flush.
pub async fn write_frame<W>(stream: &mut W, kind: FrameKind, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // ---
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(RssError::Transport(format!(
            "framing payload of {} bytes exceeds limit {MAX_PAYLOAD_LEN}",
            payload.len()
        )));
    }
    // Bounded above, cannot truncate.
    let payload_len = payload.len() as u32;

    let mut fixed = [0u8; FIXED_HEADER_LEN];
    fixed[0] = MAGIC;
    fixed[1] = VERSION;
    fixed[2] = kind.as_u8();
    fixed[3..7].copy_from_slice(&payload_len.to_be_bytes());

    stream
        .write_all(&fixed)
        .await
        .map_err(|e| RssError::Transport(format!("framing write fixed header: {e}")))?;

    stream
        .write_all(payload)
        .await
        .map_err(|e| RssError::Transport(format!("framing write payload: {e}")))?;

    Ok(())
}

// ---

/// Read one frame from `stream`.
///
/// Returns `None` on clean EOF before the first header byte, which means
/// the peer closed the connection between frames.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    // ---
    let mut fixed = [0u8; FIXED_HEADER_LEN];

    // Peek at the first byte to distinguish clean EOF from a real header.
    match stream.read(&mut fixed[..1]).await {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) => return Err(RssError::Transport(format!("framing read header[0]: {e}"))),
    }

    stream
        .read_exact(&mut fixed[1..])
        .await
        .map_err(|e| RssError::Transport(format!("framing read header[1..]: {e}")))?;

    if fixed[0] != MAGIC {
        return Err(RssError::Transport(format!(
            "framing bad magic: expected 0x{MAGIC:02X}, got 0x{:02X}",
            fixed[0]
        )));
    }

    if fixed[1] != VERSION {
        return Err(RssError::Transport(format!(
            "framing unsupported version: expected {VERSION}, got {}",
            fixed[1]
        )));
    }

    let kind = FrameKind::from_u8(fixed[2])?;
    let payload_len = u32::from_be_bytes([fixed[3], fixed[4], fixed[5], fixed[6]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(RssError::Transport(format!(
            "framing payload of {payload_len} bytes exceeds limit {MAX_PAYLOAD_LEN}"
        )));
    }

    let mut payload = vec![0u8; payload_len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| RssError::Transport(format!("framing read payload: {e}")))?;

    Ok(Some(Frame { kind, payload }))
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// Serialize `msg` as JSON and write it as a control frame.
pub async fn write_control<W, M>(stream: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = serde_json::to_vec(msg)
        .map_err(|e| RssError::Transport(format!("control serialize error: {e}")))?;
    write_frame(stream, FrameKind::Control, &payload).await
}

// ---

/// Decode a control frame's JSON payload.
pub fn decode_control<M>(frame: &Frame) -> Result<M>
where
    M: DeserializeOwned,
{
    if frame.kind != FrameKind::Control {
        return Err(RssError::Transport(format!(
            "expected control frame, got {:?}",
            frame.kind
        )));
    }
    serde_json::from_slice(&frame.payload)
        .map_err(|e| RssError::Transport(format!("control deserialize error: {e}")))
}

// ---

/// Read the next frame and decode it as a control message.  EOF is an error
/// here: the caller is waiting for a reply.
pub async fn read_control<R, M>(stream: &mut R) -> Result<M>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    match read_frame(stream).await? {
        Some(frame) => decode_control(&frame),
        None => Err(RssError::Transport("connection closed by peer".into())),
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One shuffle record as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub partition: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

// ---

/// Number of bytes [`encode_record`] appends for this record.
pub fn encoded_len(key: &[u8], value: &[u8]) -> usize {
    RECORD_OVERHEAD + key.len() + value.len()
}

/// Append one record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, partition: u32, key: &[u8], value: &[u8]) -> Result<()> {
    // ---
    let key_len = u32::try_from(key.len())
        .map_err(|_| RssError::Transport("record key exceeds 4 GiB".into()))?;
    let value_len = u32::try_from(value.len())
        .map_err(|_| RssError::Transport("record value exceeds 4 GiB".into()))?;

    buf.reserve(encoded_len(key, value));
    buf.extend_from_slice(&partition.to_be_bytes());
    buf.extend_from_slice(&key_len.to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&value_len.to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

// ---

/// Split a records payload back into records.
pub fn decode_records(mut payload: &[u8]) -> Result<Vec<Record>> {
    // ---
    let mut out = Vec::new();
    while !payload.is_empty() {
        let partition = take_u32(&mut payload, "partition")?;
        let key_len = take_u32(&mut payload, "key_len")? as usize;
        let key = take_bytes(&mut payload, key_len, "key")?;
        let value_len = take_u32(&mut payload, "value_len")? as usize;
        let value = take_bytes(&mut payload, value_len, "value")?;
        out.push(Record {
            partition,
            key,
            value,
        });
    }
    Ok(out)
}

fn take_u32(buf: &mut &[u8], field: &str) -> Result<u32> {
    let bytes = take_slice(buf, 4, field)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_bytes(buf: &mut &[u8], len: usize, field: &str) -> Result<Vec<u8>> {
    take_slice(buf, len, field).map(<[u8]>::to_vec)
}

fn take_slice<'a>(buf: &mut &'a [u8], len: usize, field: &str) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(RssError::Transport(format!(
            "truncated record: {field} needs {len} bytes, {} left",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

// ---------------------------------------------------------------------------
// Compressed blocks
// ---------------------------------------------------------------------------

/// LZ4-compress an encoded record batch, prepending its uncompressed size.
pub fn compress_block(raw: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(raw)
}

/// Inverse of [`compress_block`].  Rejects blocks that declare more than
/// [`MAX_PAYLOAD_LEN`] uncompressed bytes.
pub fn decompress_block(block: &[u8]) -> Result<Vec<u8>> {
    // ---
    if block.len() < 4 {
        return Err(RssError::Transport("lz4: block too short".into()));
    }
    let declared = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if declared > MAX_PAYLOAD_LEN {
        return Err(RssError::Transport(format!(
            "lz4: declared size {declared} exceeds limit {MAX_PAYLOAD_LEN}"
        )));
    }
    lz4_flex::decompress_size_prepended(block)
        .map_err(|e| RssError::Transport(format!("lz4: {e}")))
}

/// Records carried by a data frame, decompressing when needed.
pub fn frame_records(frame: &Frame) -> Result<Vec<Record>> {
    match frame.kind {
        FrameKind::Records => decode_records(&frame.payload),
        FrameKind::CompressedRecords => decode_records(&decompress_block(&frame.payload)?),
        FrameKind::Control => Err(RssError::Transport(
            "expected record frame, got control".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
