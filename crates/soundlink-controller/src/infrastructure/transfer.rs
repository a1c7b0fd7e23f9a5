//! Upload sender for the transfer port.
//!
//! One upload is one TCP connection:
//!
//! ```text
//! [4-byte length][{"fileId","fileName","fileSize"}]   header frame
//! [64 KiB][64 KiB]...[rest]                           raw file bytes
//! <shutdown write side>                               end of file
//! ```
//!
//! The body is read from the source in 64 KiB chunks and each chunk is
//! written before the next is read, so memory use does not grow with the
//! file.  After every chunk the progress callback receives
//! `bytes_written / file_size` in `[0.0, 1.0]`.
//!
//! The server answers on the control channel (`FILE_TRANSFER_DONE`), not on
//! this connection.

use std::path::Path;
use std::time::Duration;

use soundlink_core::domain::transfer::{progress_fraction, CHUNK_SIZE};
use soundlink_core::protocol::DEFAULT_TRANSFER_PORT;
use soundlink_core::{encode_frame, FrameError, TransferHeader};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// How long the transfer connect may take.
pub const TRANSFER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that abort an upload.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("could not connect to transfer port {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("could not read {path}: {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The source ended before `fileSize` bytes were read.
    #[error("source ended after {read} of {declared} bytes")]
    SourceShort { declared: u64, read: u64 },

    #[error("could not encode transfer header: {0}")]
    Header(#[from] FrameError),

    #[error("transfer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where to upload.
#[derive(Debug, Clone)]
pub struct TransferTarget {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl TransferTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_TRANSFER_PORT,
            connect_timeout: TRANSFER_CONNECT_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Writes the header and exactly `header.file_size` bytes from `source`
/// into `sink`, then shuts `sink` down.
///
/// Returns the number of body bytes written.
pub async fn send_stream<R, W, F>(
    source: &mut R,
    sink: &mut W,
    header: &TransferHeader,
    mut on_progress: F,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(f64),
{
    sink.write_all(&encode_frame(header)?).await?;

    let declared = header.file_size;
    let mut written: u64 = 0;
    let mut chunk = vec![0u8; CHUNK_SIZE];

    while written < declared {
        let want = (declared - written).min(CHUNK_SIZE as u64) as usize;
        let filled = fill(source, &mut chunk[..want]).await?;
        if filled < want {
            return Err(TransferError::SourceShort {
                declared,
                read: written + filled as u64,
            });
        }
        sink.write_all(&chunk[..want]).await?;
        written += want as u64;
        on_progress(progress_fraction(written, declared));
    }

    sink.shutdown().await?;
    debug!("sent {written} bytes for {}", header.file_id);
    Ok(written)
}

/// Reads until `buf` is full or the source ends; returns the bytes read.
async fn fill<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Uploads the file at `path` to `target` under `file_id`.
///
/// The file name sent to the server is the last component of `path`.
pub async fn upload_file<F>(
    target: &TransferTarget,
    path: &Path,
    file_id: &str,
    on_progress: F,
) -> Result<TransferHeader, TransferError>
where
    F: FnMut(f64),
{
    let source_error = |source| TransferError::Source {
        path: path.display().to_string(),
        source,
    };
    let mut file = tokio::fs::File::open(path).await.map_err(source_error)?;
    let size = file.metadata().await.map_err(source_error)?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_id.to_string());
    let header = TransferHeader::new(file_id, name, size);

    let addr = format!("{}:{}", target.host, target.port);
    let mut stream = match timeout(
        target.connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(TransferError::Connect { addr, source }),
        Err(_) => return Err(TransferError::ConnectTimeout { addr }),
    };

    info!("uploading {} ({size} bytes) to {addr}", header.file_name);
    send_stream(&mut file, &mut stream, &header, on_progress).await?;
    Ok(header)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
