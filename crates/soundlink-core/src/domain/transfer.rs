//! File-transfer sub-protocol types.
//!
//! Uploads use a dedicated TCP connection (the transfer port), separate from
//! the control channel so that a multi-megabyte file never delays a `STOP`.
//!
//! ```text
//! [len:4][{"fileId":..,"fileName":..,"fileSize":..}][raw bytes ...][EOF]
//! ```
//!
//! The first frame is a normal length-prefixed JSON frame carrying a
//! [`TransferHeader`].  Everything after it is the raw file content, and the
//! sender closing its write side marks the end.  The receiver compares the
//! number of bytes it got against `fileSize` to decide success.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of each raw write on the sending side and of the receiver's buffer.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// First frame on a transfer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferHeader {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
}

/// Reasons an announced upload is refused before any bytes move.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeaderRejection {
    #[error("file id must not be empty")]
    EmptyFileId,

    #[error("file name must not be empty")]
    EmptyFileName,

    #[error("file size {size} exceeds the limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },
}

/// Byte-count mismatches detected while or after receiving the body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferSizeError {
    #[error("received more than the declared {declared} bytes")]
    Overrun { declared: u64 },

    #[error("connection closed after {received} of {declared} bytes")]
    Short { declared: u64, received: u64 },
}

impl TransferHeader {
    pub fn new(file_id: impl Into<String>, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            file_size,
        }
    }

    /// Checks the header against the server's upload limit.
    pub fn validate(&self, max_file_size: u64) -> Result<(), HeaderRejection> {
        if self.file_id.trim().is_empty() {
            return Err(HeaderRejection::EmptyFileId);
        }
        if self.file_name.trim().is_empty() {
            return Err(HeaderRejection::EmptyFileName);
        }
        if self.file_size > max_file_size {
            return Err(HeaderRejection::TooLarge {
                size: self.file_size,
                max: max_file_size,
            });
        }
        Ok(())
    }

    /// Name under which the file store keeps this upload.
    pub fn stored_name(&self) -> String {
        stored_file_name(&self.file_id, &self.file_name)
    }
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
///
/// ```rust
/// use soundlink_core::domain::transfer::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("my song (live).mp3"), "my_song__live_.mp3");
/// assert_eq!(sanitize_file_name("../etc/passwd"), ".._etc_passwd");
/// ```
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns `"{file_id}_{sanitized file_name}"`.
///
/// The id prefix keeps two uploads with the same display name apart.  The id
/// itself is sanitized too, since controllers choose it.
pub fn stored_file_name(file_id: &str, file_name: &str) -> String {
    format!(
        "{}_{}",
        sanitize_file_name(file_id),
        sanitize_file_name(file_name)
    )
}

/// Fraction of `declared` bytes covered by `written`, in `[0.0, 1.0]`.
///
/// An empty file counts as fully transferred.
pub fn progress_fraction(written: u64, declared: u64) -> f64 {
    if declared == 0 {
        1.0
    } else {
        (written as f64 / declared as f64).min(1.0)
    }
}

/// Receiver-side bookkeeping for one transfer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub header: TransferHeader,
    pub bytes_received: u64,
}

impl TransferSession {
    pub fn new(header: TransferHeader) -> Self {
        Self {
            header,
            bytes_received: 0,
        }
    }

    /// Bytes still expected before the declared size is reached.
    pub fn remaining(&self) -> u64 {
        self.header.file_size.saturating_sub(self.bytes_received)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.header.file_size
    }

    /// Accounts for `n` newly received bytes.
    ///
    /// Fails without recording anything if that would pass the declared size.
    pub fn record(&mut self, n: usize) -> Result<(), TransferSizeError> {
        let n = n as u64;
        if n > self.remaining() {
            return Err(TransferSizeError::Overrun {
                declared: self.header.file_size,
            });
        }
        self.bytes_received += n;
        Ok(())
    }

    /// Called at EOF.  Succeeds only when exactly the declared size arrived.
    pub fn finish(&self) -> Result<(), TransferSizeError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(TransferSizeError::Short {
                declared: self.header.file_size,
                received: self.bytes_received,
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
