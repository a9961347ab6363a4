//! Binary framing for the supervisor/worker channel.
//!
//! Wire format: [4 bytes: frame length][4 bytes: metadata length][JSON metadata][16-byte aligned binary blobs]
//!
//! Audio buffers never travel inside the JSON. Each `Value::Buffer` is moved into
//! the payload as little-endian f32 samples and replaced in the metadata by a
//! `Value::Blob` span pointing at it.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::messages::{BlobSpan, FrameValues, Value};

/// Upper bound on a single frame, metadata and payload included.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Payload alignment boundary (16 bytes)
const PAYLOAD_ALIGNMENT: usize = 16;

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// Metadata bytes a blob span can take, separator included.
const BLOB_SPAN_JSON_BYTES: usize = 96;

/// Metadata bytes an invoke envelope takes besides its method and args.
const INVOKE_ENVELOPE_JSON_BYTES: usize = 128;

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// True when the peer closed the stream at a frame boundary.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Align offset to payload alignment boundary
fn align(offset: usize) -> usize {
    let remainder = offset % PAYLOAD_ALIGNMENT;
    if remainder == 0 {
        offset
    } else {
        offset + (PAYLOAD_ALIGNMENT - remainder)
    }
}

/// Fail with `FrameTooLarge` when a frame body of `len` bytes is over the limit.
pub fn ensure_frame_fits(len: usize) -> Result<()> {
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(())
}

/// Upper bound on the frame body an invoke of `method` with `args` encodes to.
///
/// Buffers are sized from their length, never copied or serialized.
pub fn invoke_len_bound(method: &str, args: &[Value]) -> Result<usize> {
    let mut metadata = INVOKE_ENVELOPE_JSON_BYTES + serde_json::to_vec(method)?.len();
    let mut payload = 0usize;
    for value in args {
        match value {
            Value::Buffer(samples) => {
                payload = align(payload).saturating_add(samples.len().saturating_mul(SAMPLE_BYTES));
                metadata += BLOB_SPAN_JSON_BYTES;
            }
            other => metadata += serde_json::to_vec(other)?.len() + 1,
        }
    }
    Ok((4 + metadata).saturating_add(payload))
}

/// Move every buffer value into `payload`, leaving blob spans behind.
fn extract_blobs(values: Vec<&mut Value>, payload: &mut Vec<u8>) {
    for value in values {
        if let Value::Buffer(samples) = value {
            let samples = std::mem::take(samples);
            let offset = align(payload.len());
            payload.resize(offset, 0);
            payload.reserve(samples.len() * SAMPLE_BYTES);
            for sample in &samples {
                payload.extend_from_slice(&sample.to_le_bytes());
            }
            *value = Value::Blob(BlobSpan {
                offset,
                len: samples.len(),
            });
        }
    }
}

/// Replace blob spans with the buffers they point at.
fn restore_blobs(values: Vec<&mut Value>, payload: &[u8]) -> Result<()> {
    for value in values {
        if let Value::Blob(span) = value {
            let end = span
                .len
                .checked_mul(SAMPLE_BYTES)
                .and_then(|bytes| span.offset.checked_add(bytes))
                .filter(|&end| end <= payload.len())
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "blob at offset {} with {} samples exceeds payload of {} bytes",
                        span.offset,
                        span.len,
                        payload.len()
                    ))
                })?;
            let samples = payload[span.offset..end]
                .chunks_exact(SAMPLE_BYTES)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            *value = Value::Buffer(samples);
        }
    }
    Ok(())
}

/// Encode a message into a complete frame, length prefix included.
pub fn encode_frame<M: Serialize + FrameValues>(mut msg: M) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    extract_blobs(msg.values_mut(), &mut payload);

    let metadata = serde_json::to_vec(&msg)?;
    let body_len = 4 + metadata.len() + payload.len();
    ensure_frame_fits(body_len)?;

    // Build frame: [4 bytes length][4 bytes metadata length][metadata][payload]
    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    frame.extend_from_slice(&metadata);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame body (everything after the outer length prefix).
pub fn decode_frame<M: DeserializeOwned + FrameValues>(body: &[u8]) -> Result<M> {
    if body.len() < 4 {
        return Err(ProtocolError::Malformed(format!(
            "frame body of {} bytes is shorter than its header",
            body.len()
        )));
    }
    let metadata_len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let metadata_end = 4usize
        .checked_add(metadata_len)
        .filter(|&end| end <= body.len())
        .ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "metadata length {} exceeds frame body of {} bytes",
                metadata_len,
                body.len()
            ))
        })?;

    let mut msg: M = serde_json::from_slice(&body[4..metadata_end])?;
    restore_blobs(msg.values_mut(), &body[metadata_end..])?;
    Ok(msg)
}

/// Write one message as a frame and flush.
pub fn write_frame<W: Write, M: Serialize + FrameValues>(mut w: W, msg: M) -> Result<()> {
    let frame = encode_frame(msg)?;
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Read one frame and decode it.
pub fn read_frame<R: Read, M: DeserializeOwned + FrameValues>(mut r: R) -> Result<M> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    ensure_frame_fits(len)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    decode_frame(&body)
}
