//! Network infrastructure for the controller application.
//!
//! [`ControllerClient`] owns one control connection to a server:
//!
//! - `connect(host, port)` starts a background task and returns the receiver
//!   on which every [`ClientEvent`] (status changes and server messages) is
//!   delivered in order.
//! - `send(message)` is fire-and-forget: the frame is queued on a bounded
//!   outbound queue and written by a dedicated writer task.  It returns
//!   `false` when not connected or when the queue is full.
//! - `ping(timeout)` sends a PING and waits for the PONG with the same `id`.
//! - `disconnect()` closes the connection.
//!
//! [`RemoteSession`] layers a [`crate::application::mirror::ServerMirror`]
//! and request/reply waits on top, for one-shot commands and uploads.
//!
//! The client never asks the server for anything on its own.  After
//! [`ConnectionStatus::Connected`] the owner decides what to request (the
//! server pushes a snapshot to every new session anyway).
//!
//! # Connection task (for beginners)
//!
//! ```text
//!            ┌──────────── reconnect policy ◄──────────┐
//!            ▼                                          │
//! Connecting ──TcpStream::connect (10 s timeout)──► Connected
//!                                                       │
//!                    reader: socket ─► FrameDecoder ─► events
//!                    writer: outbound queue ─► socket
//! ```
//!
//! Each connection attempt runs inside one Tokio task.  The reader half
//! stays in that task; the writer half moves to its own task so a slow
//! socket never blocks message delivery.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::{Duration, Instant};

use soundlink_core::protocol::{ControllerEnvelope, ServerEnvelope};
use soundlink_core::{encode_frame, ControllerMsg, Envelope, FrameDecoder, FrameError, ServerMsg};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use crate::application::events::{ClientEvent, ConnectionStatus};

mod reconnect;
pub mod session;
pub use reconnect::ReconnectPolicy;
pub use session::{RemoteSession, SessionError};

/// How long a TCP connect may take before the attempt is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the outbound frame queue.
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 64;

const EVENT_CHANNEL_DEPTH: usize = 256;
const READ_BUF_SIZE: usize = 8 * 1024;

/// Errors that can occur in the controller network layer.
#[derive(Debug, Error)]
pub enum ClientNetworkError {
    /// The server refused or reset the TCP connect.
    #[error("could not connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP connect did not complete in time.
    #[error("connection to {addr} timed out after {} s", .timeout.as_secs())]
    ConnectTimeout { addr: String, timeout: Duration },

    /// There is no open connection.
    #[error("not connected")]
    NotConnected,

    /// No PONG arrived for a PING.
    #[error("no reply to ping within {0:?}")]
    PingTimeout(Duration),

    /// The connection closed while waiting for a reply.
    #[error("connection closed")]
    Closed,

    /// The server sent a frame that makes the stream unusable.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),

    /// An I/O error occurred on the established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for a [`ControllerClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub outbound_queue_depth: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            reconnect: ReconnectPolicy::Never,
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// State shared between the client handle and its connection task.
///
/// Every `connect` bumps `generation`; a task only touches the shared state
/// while its generation is current, so a task that is still winding down
/// cannot clobber a newer connection.
#[derive(Default)]
struct Shared {
    generation: AtomicU64,
    status: Mutex<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pings: Mutex<HashMap<String, oneshot::Sender<()>>>,
    stop: Mutex<Option<Arc<Notify>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_status(&self, generation: u64, status: ConnectionStatus) {
        if self.is_current(generation) {
            *lock(&self.status) = status;
        }
    }

    fn set_outbound(&self, generation: u64, outbound: Option<mpsc::Sender<Vec<u8>>>) {
        if self.is_current(generation) {
            *lock(&self.outbound) = outbound;
        }
    }

    fn resolve_ping(&self, id: &str) {
        if let Some(waiter) = lock(&self.pings).remove(id) {
            let _ = waiter.send(());
        }
    }

    /// Drops every pending ping so its caller sees the connection close.
    fn abandon_pings(&self) {
        lock(&self.pings).clear();
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// A single control-channel session with a server.
pub struct ControllerClient {
    config: ClientConfig,
    shared: Arc<Shared>,
}

impl ControllerClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *lock(&self.shared.status)
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Starts connecting to `host:port`, closing any previous connection.
    ///
    /// Must be called from within a Tokio runtime.  The returned receiver
    /// yields [`ClientEvent`]s until the connection task ends.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> mpsc::Receiver<ClientEvent> {
        self.disconnect();

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = Arc::new(Notify::new());
        *lock(&self.shared.stop) = Some(Arc::clone(&stop));
        *lock(&self.shared.status) = ConnectionStatus::Connecting;

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        tokio::spawn(connection_task(
            ConnectionTarget {
                host: host.into(),
                port,
            },
            self.config.clone(),
            Arc::clone(&self.shared),
            generation,
            events,
            stop,
        ));
        rx
    }

    /// Queues `body` in a fresh envelope.  See [`Self::send_envelope`].
    pub fn send(&self, body: ControllerMsg) -> bool {
        self.send_envelope(&Envelope::new(body))
    }

    /// Queues `envelope` for the writer task.
    ///
    /// Returns `false` when not connected or when the outbound queue is
    /// full.  A `true` result means "queued", not "delivered".
    pub fn send_envelope(&self, envelope: &ControllerEnvelope) -> bool {
        let frame = match encode_frame(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("cannot encode {}: {e}", envelope.body.kind());
                return false;
            }
        };

        let outbound = lock(&self.shared.outbound);
        let Some(tx) = outbound.as_ref() else {
            debug!("not connected; dropping {}", envelope.body.kind());
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("outbound queue full; dropping {}", envelope.body.kind());
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Sends a PING and waits for the PONG carrying the same id.
    ///
    /// Returns the round-trip time.
    ///
    /// # Errors
    ///
    /// - [`ClientNetworkError::NotConnected`] if the PING could not be queued.
    /// - [`ClientNetworkError::PingTimeout`] if no PONG arrived in time.
    /// - [`ClientNetworkError::Closed`] if the connection closed first.
    pub async fn ping(&self, wait: Duration) -> Result<Duration, ClientNetworkError> {
        let envelope = Envelope::new(ControllerMsg::Ping);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pings).insert(envelope.id.clone(), tx);

        let started = Instant::now();
        if !self.send_envelope(&envelope) {
            lock(&self.shared.pings).remove(&envelope.id);
            return Err(ClientNetworkError::NotConnected);
        }

        match timeout(wait, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(ClientNetworkError::Closed),
            Err(_) => {
                lock(&self.shared.pings).remove(&envelope.id);
                Err(ClientNetworkError::PingTimeout(wait))
            }
        }
    }

    /// Closes the connection (or stops a pending connect or reconnect).
    ///
    /// The event receiver gets a final [`ConnectionStatus::Disconnected`].
    pub fn disconnect(&self) {
        if let Some(stop) = lock(&self.shared.stop).take() {
            stop.notify_one();
        }
        *lock(&self.shared.outbound) = None;
    }
}

impl Default for ControllerClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Drop for ControllerClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ── Connection task ───────────────────────────────────────────────────────────

struct ConnectionTarget {
    host: String,
    port: u16,
}

impl ConnectionTarget {
    fn display(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How a connected session ended without an error.
enum SessionEnd {
    /// The server closed the stream.
    Closed,
    /// `disconnect` was called or the event receiver was dropped.
    Stopped,
}

struct Reporter {
    shared: Arc<Shared>,
    generation: u64,
    events: mpsc::Sender<ClientEvent>,
}

impl Reporter {
    /// Records and emits a status change.  Returns `false` if nobody is
    /// listening any more.
    async fn status(&self, status: ConnectionStatus, cause: Option<String>) -> bool {
        self.shared.set_status(self.generation, status);
        self.events
            .send(ClientEvent::Status { status, cause })
            .await
            .is_ok()
    }

    async fn message(&self, envelope: ServerEnvelope) -> bool {
        self.events.send(ClientEvent::Message(envelope)).await.is_ok()
    }
}

async fn connection_task(
    target: ConnectionTarget,
    config: ClientConfig,
    shared: Arc<Shared>,
    generation: u64,
    events: mpsc::Sender<ClientEvent>,
    stop: Arc<Notify>,
) {
    let addr = target.display();
    let reporter = Reporter {
        shared,
        generation,
        events,
    };
    let mut attempt: u32 = 0;

    loop {
        if !reporter.status(ConnectionStatus::Connecting, None).await {
            return;
        }
        debug!("connecting to {addr}");

        let connect = timeout(
            config.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        );
        let outcome = tokio::select! {
            _ = stop.notified() => {
                reporter.status(ConnectionStatus::Disconnected, None).await;
                return;
            }
            outcome = connect => outcome,
        };

        let ended = match outcome {
            Err(_) => Err(ClientNetworkError::ConnectTimeout {
                addr: addr.clone(),
                timeout: config.connect_timeout,
            }),
            Ok(Err(source)) => Err(ClientNetworkError::ConnectFailed {
                addr: addr.clone(),
                source,
            }),
            Ok(Ok(stream)) => {
                attempt = 0;
                info!("connected to {addr}");
                run_session(stream, &config, &reporter, &stop).await
            }
        };

        match ended {
            Ok(SessionEnd::Stopped) => {
                info!("disconnected from {addr}");
                reporter.status(ConnectionStatus::Disconnected, None).await;
                return;
            }
            Ok(SessionEnd::Closed) => {
                info!("server {addr} closed the connection");
                if !reporter.status(ConnectionStatus::Disconnected, None).await {
                    return;
                }
            }
            Err(e) => {
                warn!("connection to {addr} failed: {e}");
                if !reporter
                    .status(ConnectionStatus::Error, Some(e.to_string()))
                    .await
                {
                    return;
                }
            }
        }

        attempt = attempt.saturating_add(1);
        let Some(delay) = config.reconnect.delay(attempt) else {
            return;
        };
        info!("reconnecting to {addr} in {delay:?}");
        tokio::select! {
            _ = stop.notified() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session(
    stream: TcpStream,
    config: &ClientConfig,
    reporter: &Reporter,
    stop: &Notify,
) -> Result<SessionEnd, ClientNetworkError> {
    let (mut reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(config.outbound_queue_depth.max(1));
    reporter
        .shared
        .set_outbound(reporter.generation, Some(out_tx));
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let result = if reporter.status(ConnectionStatus::Connected, None).await {
        read_loop(&mut reader, reporter, stop).await
    } else {
        Ok(SessionEnd::Stopped)
    };

    reporter.shared.set_outbound(reporter.generation, None);
    reporter.shared.abandon_pings();
    writer_task.abort();
    result
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    reporter: &Reporter,
    stop: &Notify,
) -> Result<SessionEnd, ClientNetworkError> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = tokio::select! {
            _ = stop.notified() => return Ok(SessionEnd::Stopped),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(SessionEnd::Closed);
        }

        for result in decoder.feed::<ServerEnvelope>(&buf[..n]) {
            match result {
                Ok(envelope) => {
                    if matches!(envelope.body, ServerMsg::Pong) {
                        reporter.shared.resolve_ping(&envelope.id);
                    }
                    if !reporter.message(envelope).await {
                        return Ok(SessionEnd::Stopped);
                    }
                }
                Err(e) if e.is_stream_fatal() => return Err(e.into()),
                Err(e) => warn!("dropping undecodable server frame: {e}"),
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!("control channel write failed: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
