//! Transfer server: receives uploads on the dedicated transfer port.
//!
//! Each upload is one TCP connection:
//!
//! 1. Read one length-prefixed JSON frame holding the [`TransferHeader`].
//! 2. Create a `.partial` file next to the target in the [`FileStore`].
//! 3. Copy raw bytes through a 64 KiB buffer straight into it until the
//!    sender closes its write side.
//! 4. Compare the byte count against `fileSize`, then rename the partial
//!    file over the target.
//!
//! The outcome is reported to the dispatcher as
//! [`ServerEvent::TransferFinished`]; the dispatcher updates the catalog and
//! tells every controller.  A failed upload only ever deletes its own partial
//! file, so a file already stored under the same id survives it.
//!
//! Memory use per upload is bounded by the copy buffer, no matter how big the
//! file is.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use soundlink_core::domain::transfer::{
    HeaderRejection, TransferHeader, TransferSession, TransferSizeError, CHUNK_SIZE,
};
use soundlink_core::protocol::codec::LENGTH_PREFIX_SIZE;
use soundlink_core::protocol::{DEFAULT_TRANSFER_PORT, MAX_FRAME_LEN};
use soundlink_core::{decode_frame, FrameError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::NetworkError;
use crate::application::dispatch::ServerEvent;
use crate::application::storage::{partial_name, FileStore, FileStoreError};

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Largest upload accepted when no limit is configured (1 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Errors that end an upload.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The header frame was missing, truncated, oversized, or not valid JSON.
    #[error("invalid transfer header: {0}")]
    Header(#[from] FrameError),

    /// The header was well-formed but refused.
    #[error("upload refused: {0}")]
    Rejected(#[from] HeaderRejection),

    /// The body was longer or shorter than announced.
    #[error(transparent)]
    Size(#[from] TransferSizeError),

    /// Reading from the socket failed.
    #[error("transfer I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file store refused the write.
    #[error("storage error: {0}")]
    Store(#[from] FileStoreError),
}

/// Configuration for the transfer listener.
#[derive(Debug, Clone)]
pub struct TransferServerConfig {
    pub bind_addr: SocketAddr,
    pub max_file_size: u64,
}

impl Default for TransferServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TRANSFER_PORT)),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// A running transfer listener.
pub struct TransferServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl TransferServer {
    /// Binds the listener and starts accepting uploads.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the port cannot be bound.
    pub async fn start(
        config: TransferServerConfig,
        store: Arc<dyn FileStore>,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| NetworkError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("transfer server listening on {local_addr}");

        let running = Arc::new(AtomicBool::new(true));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            store,
            events,
            config.max_file_size,
            Arc::clone(&running),
        ));

        Ok(Self {
            local_addr,
            running,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new uploads.  Uploads already in progress finish.
    pub async fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        if let Err(e) = self.accept_task.await {
            error!("transfer accept loop ended abnormally: {e}");
        }
        info!("transfer server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<dyn FileStore>,
    events: mpsc::Sender<ServerEvent>,
    max_file_size: u64,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("upload connection from {peer}");
                let store = Arc::clone(&store);
                let events = events.clone();
                tokio::spawn(async move {
                    handle_upload(stream, peer, store.as_ref(), &events, max_file_size).await;
                });
            }
            Ok(Err(e)) => error!("transfer accept error: {e}"),
            Err(_) => {}
        }
    }
}

async fn handle_upload<R>(
    mut stream: R,
    peer: SocketAddr,
    store: &dyn FileStore,
    events: &mpsc::Sender<ServerEvent>,
    max_file_size: u64,
) where
    R: AsyncRead + Unpin,
{
    let header = match read_header(&mut stream).await {
        Ok(header) => header,
        Err(e) => {
            warn!("upload from {peer} dropped: {e}");
            return;
        }
    };

    let result = receive_body(&mut stream, &header, store, max_file_size)
        .await
        .map_err(|e| e.to_string());

    match &result {
        Ok(n) => info!("upload {} from {peer} complete ({n} bytes)", header.file_id),
        Err(e) => warn!("upload {} from {peer} failed: {e}", header.file_id),
    }

    let _ = events
        .send(ServerEvent::TransferFinished { header, result })
        .await;
}

/// Reads the single header frame that opens every transfer connection.
///
/// Reads exactly the declared frame, so any bytes after it stay in the
/// stream as file content.
pub async fn read_header<R>(stream: &mut R) -> Result<TransferHeader, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut prefix).await?;
    let declared = u32::from_be_bytes(prefix) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            declared,
            max: MAX_FRAME_LEN,
        }
        .into());
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + declared);
    frame.extend_from_slice(&prefix);
    frame.resize(LENGTH_PREFIX_SIZE + declared, 0);
    stream.read_exact(&mut frame[LENGTH_PREFIX_SIZE..]).await?;

    let (header, _) = decode_frame::<TransferHeader>(&frame)?;
    Ok(header)
}

/// Streams the upload body into the store and returns the byte count.
///
/// The body is written under [`partial_name`] and renamed into place only
/// once the byte count matches.  On failure the partial file is deleted and
/// the stored file, if any, is left untouched.
pub async fn receive_body<R>(
    stream: &mut R,
    header: &TransferHeader,
    store: &dyn FileStore,
    max_file_size: u64,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    header.validate(max_file_size)?;

    let stored_name = header.stored_name();
    let partial = partial_name(&stored_name);
    let mut writer = store.create(&partial).await?;
    let mut session = TransferSession::new(header.clone());

    let outcome: Result<(), TransferError> = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            session.record(n)?;
            writer.write_all(&buf[..n]).await?;
        }
        writer.shutdown().await?;
        session.finish()?;
        Ok(())
    }
    .await;
    drop(writer);

    let outcome: Result<(), TransferError> = match outcome {
        Ok(()) => store.rename(&partial, &stored_name).await.map_err(Into::into),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => Ok(session.bytes_received),
        Err(e) => {
            match store.delete(&partial).await {
                Ok(()) | Err(FileStoreError::NotFound(_)) => {}
                Err(del) => warn!("could not remove partial upload {partial}: {del}"),
            }
            Err(e)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
