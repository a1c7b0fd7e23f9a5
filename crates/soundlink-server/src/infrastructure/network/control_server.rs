//! Control server: accept loop, per-session tasks, and outbound fan-out.
//!
//! # Session lifecycle
//!
//! ```text
//! accept ─▶ register "ip:port" ─▶ Connected ─▶ reader loop ─▶ unregister ─▶ Disconnected
//!                 │                                  │
//!                 └──── writer task (outbound queue) ◀┘ (ERROR replies)
//! ```
//!
//! Each connection gets two Tokio tasks:
//!
//! - **Reader** – feeds socket bytes through a [`FrameDecoder`] and forwards
//!   every decoded message to the dispatcher as a [`SessionEvent::Message`].
//! - **Writer** – drains the session's bounded outbound queue into the socket.
//!
//! Outbound frames are encoded once and shared (`Arc`) between all queues, so
//! a broadcast to twenty controllers serializes the JSON a single time.
//!
//! When a session ends, its queue is closed and the writer gets up to
//! [`WRITER_DRAIN_TIMEOUT`] to flush what is already queued before the socket
//! is dropped.
//!
//! # Backpressure
//!
//! A controller that stops reading fills its queue.  Instead of letting one
//! stalled phone hold up a broadcast, the server disconnects that session as
//! soon as its queue is full.  The controller can reconnect and will receive
//! a fresh snapshot.
//!
//! # Protocol violations
//!
//! - A malformed JSON payload gets an `ERROR INVALID_REQUEST` reply and the
//!   session continues.
//! - An oversized length prefix closes the session: the stream can no longer
//!   be framed reliably.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, PoisonError, RwLock,
};
use std::time::Duration;

use soundlink_core::protocol::messages::{ControllerEnvelope, ServerEnvelope};
use soundlink_core::protocol::DEFAULT_CONTROL_PORT;
use soundlink_core::{encode_frame, Envelope, ErrorCode, FrameDecoder, ServerMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::NetworkError;
use crate::application::dispatch::{MessageSink, ServerEvent, SessionEvent, SessionId};

/// Default depth of each session's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 256;

/// How long a closing session's writer may spend flushing its queue.
pub const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const READ_BUF_SIZE: usize = 8 * 1024;

type Frame = Arc<Vec<u8>>;

/// Configuration for the control listener.
#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    pub bind_addr: SocketAddr,
    pub outbound_queue_depth: usize,
}

impl Default for ControlServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONTROL_PORT)),
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
        }
    }
}

// ── Session registry ──────────────────────────────────────────────────────────

struct SessionSlot {
    outbound: mpsc::Sender<Frame>,
    shutdown: Arc<Notify>,
}

/// All live sessions, keyed by `"ip:port"`.
#[derive(Default)]
struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionSlot>>,
}

impl SessionRegistry {
    fn insert(&self, id: SessionId, slot: SessionSlot) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot);
    }

    /// Removes `id` and wakes its reader so the connection closes.
    fn disconnect(&self, id: &str) -> bool {
        let slot = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match slot {
            Some(slot) => {
                slot.shutdown.notify_one();
                true
            }
            None => false,
        }
    }

    fn disconnect_all(&self) {
        let drained: Vec<_> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, slot) in drained {
            slot.shutdown.notify_one();
        }
    }

    fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn send_frame(&self, id: &str, frame: Frame) -> bool {
        let result = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            match sessions.get(id) {
                Some(slot) => slot.outbound.try_send(frame),
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("session {id}: outbound queue full; disconnecting");
                self.disconnect(id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.disconnect(id);
                false
            }
        }
    }

    fn broadcast_frame(&self, frame: Frame) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            for (id, slot) in sessions.iter() {
                match slot.outbound.try_send(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("session {id}: outbound queue full; disconnecting");
                        dropped.push(id.clone());
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(id.clone()),
                }
            }
        }
        for id in dropped {
            self.disconnect(&id);
        }
        delivered
    }
}

fn encode(message: &ServerEnvelope) -> Option<Frame> {
    match encode_frame(message) {
        Ok(bytes) => Some(Arc::new(bytes)),
        Err(e) => {
            error!("failed to encode {}: {e}", message.body.kind());
            None
        }
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Cheap, cloneable handle for sending to sessions.
#[derive(Clone)]
pub struct ControlServerHandle {
    registry: Arc<SessionRegistry>,
}

impl ControlServerHandle {
    /// Number of sessions currently registered.
    pub fn connected_count(&self) -> usize {
        self.registry.len()
    }

    /// Closes one session.  Returns `false` if it was not connected.
    pub fn disconnect(&self, session: &str) -> bool {
        self.registry.disconnect(session)
    }
}

impl MessageSink for ControlServerHandle {
    fn send_to(&self, session: &str, message: &ServerEnvelope) -> bool {
        match encode(message) {
            Some(frame) => self.registry.send_frame(session, frame),
            None => false,
        }
    }

    fn broadcast(&self, message: &ServerEnvelope) -> usize {
        match encode(message) {
            Some(frame) => self.registry.broadcast_frame(frame),
            None => 0,
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// A running control listener.
pub struct ControlServer {
    local_addr: SocketAddr,
    handle: ControlServerHandle,
    running: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl ControlServer {
    /// Binds the listener and starts accepting sessions.
    ///
    /// Session lifecycle and traffic is reported on `events`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the port cannot be bound.
    pub async fn start(
        config: ControlServerConfig,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| NetworkError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("control server listening on {local_addr}");

        let registry = Arc::new(SessionRegistry::default());
        let running = Arc::new(AtomicBool::new(true));
        let depth = config.outbound_queue_depth.max(1);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            events,
            depth,
            Arc::clone(&running),
        ));

        Ok(Self {
            local_addr,
            handle: ControlServerHandle { registry },
            running,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a handle implementing [`MessageSink`].
    pub fn handle(&self) -> ControlServerHandle {
        self.handle.clone()
    }

    pub fn connected_count(&self) -> usize {
        self.handle.connected_count()
    }

    pub fn send_to(&self, session: &str, message: &ServerEnvelope) -> bool {
        self.handle.send_to(session, message)
    }

    pub fn broadcast(&self, message: &ServerEnvelope) -> usize {
        self.handle.broadcast(message)
    }

    /// Stops accepting, closes every session, and waits for the accept loop.
    pub async fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        self.handle.registry.disconnect_all();
        if let Err(e) = self.accept_task.await {
            error!("control accept loop ended abnormally: {e}");
        }
        info!("control server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    events: mpsc::Sender<ServerEvent>,
    depth: usize,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {peer}: {e}");
                }
                tokio::spawn(run_session(
                    stream,
                    peer,
                    Arc::clone(&registry),
                    events.clone(),
                    depth,
                ));
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }
}

// ── Per-session tasks ─────────────────────────────────────────────────────────

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    events: mpsc::Sender<ServerEvent>,
    depth: usize,
) {
    let session_id: SessionId = peer.to_string();
    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::channel::<Frame>(depth);
    let shutdown = Arc::new(Notify::new());

    registry.insert(
        session_id.clone(),
        SessionSlot {
            outbound: outbound.clone(),
            shutdown: Arc::clone(&shutdown),
        },
    );

    if events
        .send(ServerEvent::Session(SessionEvent::Connected(session_id.clone())))
        .await
        .is_err()
    {
        registry.disconnect(&session_id);
        return;
    }

    let mut writer = tokio::spawn(write_loop(
        write_half,
        outbound_rx,
        session_id.clone(),
        Arc::clone(&shutdown),
    ));

    read_loop(read_half, &session_id, &events, &outbound, &shutdown).await;

    // Dropping the last senders lets the writer flush and exit.
    registry.disconnect(&session_id);
    drop(outbound);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!("session {session_id}: queue not flushed in time; dropping it");
        writer.abort();
    }

    let _ = events
        .send(ServerEvent::Session(SessionEvent::Disconnected(session_id)))
        .await;
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    session_id: &str,
    events: &mpsc::Sender<ServerEvent>,
    outbound: &mpsc::Sender<Frame>,
    shutdown: &Notify,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("session {session_id}: closed by peer");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("session {session_id}: read failed: {e}");
                    return;
                }
            },
            _ = shutdown.notified() => {
                debug!("session {session_id}: closing");
                return;
            }
        };

        for result in decoder.feed::<ControllerEnvelope>(&buf[..n]) {
            match result {
                Ok(message) => {
                    let event = ServerEvent::Session(SessionEvent::Message {
                        session: session_id.to_string(),
                        message,
                    });
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) if e.is_stream_fatal() => {
                    warn!("session {session_id}: {e}; closing connection");
                    return;
                }
                Err(e) => {
                    let reply = Envelope::new(ServerMsg::Error {
                        code: ErrorCode::InvalidRequest,
                        message: e.to_string(),
                    });
                    if let Some(frame) = encode(&reply) {
                        let _ = outbound.try_send(frame);
                    }
                }
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    session_id: SessionId,
    shutdown: Arc<Notify>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            warn!("session {session_id}: write failed: {e}");
            shutdown.notify_one();
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
