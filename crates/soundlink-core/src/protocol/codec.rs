//! Length-prefixed JSON frame codec for the SoundLink control channel.
//!
//! Wire format:
//! ```text
//! [payload_len:4][payload:N]
//! ```
//! `payload_len` is an unsigned 32-bit big-endian integer; the payload is the
//! UTF-8 JSON serialization of one message.  Payloads larger than
//! [`MAX_FRAME_LEN`] (50 MiB) are a protocol violation.
//!
//! # Why a length prefix? (for beginners)
//!
//! TCP is a *stream* protocol: a single `read()` may return half a message, or
//! three messages glued together.  The 4-byte prefix tells the receiver exactly
//! how many bytes belong to the next message, so [`FrameDecoder`] can buffer
//! partial input across reads and cut complete frames out of the stream.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// Size of the big-endian length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload a frame may declare (50 MiB).
pub const MAX_FRAME_LEN: usize = 50 * 1024 * 1024;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// The byte slice does not yet hold a complete frame.
    #[error("incomplete frame: need {needed} bytes, got {available}")]
    Incomplete { needed: usize, available: usize },

    /// The length prefix declares a payload larger than the allowed maximum.
    #[error("declared frame length {declared} exceeds maximum of {max} bytes")]
    Oversized { declared: usize, max: usize },

    /// The payload is not valid JSON for the expected message type.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(String),
}

impl FrameError {
    /// Returns `true` when the stream can no longer be trusted and the
    /// connection carrying it should be closed.
    ///
    /// A malformed payload only spoils one frame; the next prefix is still
    /// aligned.  An oversized prefix means the framing itself is corrupt.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(self, FrameError::Oversized { .. })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `msg` into a length-prefixed frame.
///
/// # Errors
///
/// Returns [`FrameError::Serialize`] if JSON serialization fails and
/// [`FrameError::Oversized`] if the payload exceeds [`MAX_FRAME_LEN`].
///
/// # Examples
///
/// ```rust
/// use soundlink_core::protocol::{decode_frame, encode_frame, ControllerMsg, Envelope};
///
/// let msg = Envelope::with_id("abc", ControllerMsg::Ping);
/// let bytes = encode_frame(&msg).unwrap();
/// let (decoded, consumed): (Envelope<ControllerMsg>, usize) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(msg).map_err(|e| FrameError::Serialize(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            declared: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed
/// (prefix + payload), so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`FrameError::Incomplete`] when more bytes are needed,
/// [`FrameError::Oversized`] for an out-of-range prefix, and
/// [`FrameError::MalformedPayload`] when the JSON does not parse.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameError> {
    let payload_len = match read_prefix(bytes, MAX_FRAME_LEN)? {
        Some(len) => len,
        None => {
            return Err(FrameError::Incomplete {
                needed: LENGTH_PREFIX_SIZE,
                available: bytes.len(),
            })
        }
    };

    let total = LENGTH_PREFIX_SIZE + payload_len;
    if bytes.len() < total {
        return Err(FrameError::Incomplete {
            needed: total,
            available: bytes.len(),
        });
    }

    let msg = parse_payload(&bytes[LENGTH_PREFIX_SIZE..total])?;
    Ok((msg, total))
}

// ── Streaming decoder ─────────────────────────────────────────────────────────

/// Incremental decoder that reassembles frames from arbitrarily split input.
///
/// Feed it every chunk a socket read returns; it keeps whatever does not yet
/// form a complete frame and yields one result per complete frame, in order.
///
/// - A malformed JSON payload yields `Err(MalformedPayload)` for that frame
///   and decoding continues with the next one.
/// - An oversized length prefix discards the *entire* pending buffer and
///   yields `Err(Oversized)`.  The decoder does not try to find the next frame
///   boundary; callers should close the connection
///   (see [`FrameError::is_stream_fatal`]).
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a decoder enforcing [`MAX_FRAME_LEN`].
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// Creates a decoder with a custom payload limit.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_frame_len,
        }
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Drops all buffered bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Appends `data` and returns every frame it completes.
    pub fn feed<T: DeserializeOwned>(&mut self, data: &[u8]) -> Vec<Result<T, FrameError>> {
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        let mut cursor = 0;

        loop {
            let rest = &self.buf[cursor..];
            let payload_len = match read_prefix(rest, self.max_frame_len) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    error!("protocol violation, discarding {} buffered bytes: {e}", self.buf.len());
                    self.buf.clear();
                    out.push(Err(e));
                    return out;
                }
            };

            let total = LENGTH_PREFIX_SIZE + payload_len;
            if rest.len() < total {
                break;
            }

            let result = parse_payload(&rest[LENGTH_PREFIX_SIZE..total]);
            if let Err(e) = &result {
                warn!("dropping frame of {payload_len} bytes: {e}");
            }
            out.push(result);
            cursor += total;
        }

        self.buf.drain(..cursor);
        out
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

/// Reads the length prefix, returning `None` when fewer than 4 bytes exist.
fn read_prefix(bytes: &[u8], max: usize) -> Result<Option<usize>, FrameError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if declared > max {
        return Err(FrameError::Oversized { declared, max });
    }
    Ok(Some(declared))
}

fn parse_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(payload).map_err(|e| FrameError::MalformedPayload(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
