//! LAN discovery responder.
//!
//! The server binds a UDP socket on the discovery port (default 9878) and
//! makes itself findable in two ways:
//!
//! 1. **Announce on start.**  One `announce` datagram is broadcast as soon as
//!    the responder is up, so controllers that are already browsing see the
//!    server immediately.
//! 2. **Answer probes.**  A controller that starts browsing broadcasts a
//!    `probe`; every server answers with a unicast `announce` carrying its
//!    display name and control port.
//!
//! [`DiscoveryResponder::unpublish`] and shutdown broadcast a `goodbye`
//! datagram so browsers can drop the entry without waiting for it to age
//! out.  An unpublished responder keeps its socket but ignores probes until
//! [`DiscoveryResponder::publish`] is called again.
//!
//! # How UDP discovery works (for beginners)
//!
//! UDP is connectionless and does not guarantee delivery.  That is fine for
//! discovery: a lost probe is simply repeated by the browser a few seconds
//! later.  A datagram sent to `255.255.255.255` reaches every device on the
//! local network segment, which is how a controller finds servers without
//! knowing any address up front.
//!
//! # Threading
//!
//! The socket is a blocking `std::net::UdpSocket` served by a dedicated
//! thread.  Its read timeout (500 ms) lets the thread notice the `running`
//! flag and exit promptly after [`DiscoveryResponder::stop`].

use std::net::{SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use soundlink_core::domain::discovery::DiscoveryDatagram;
use soundlink_core::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Error type for discovery responder operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket configuration or thread creation failed.
    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the responder advertises and where.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub bind_addr: SocketAddr,
    /// Destination of `announce` and `goodbye` broadcasts.
    pub broadcast_addr: SocketAddr,
    pub device_name: String,
    pub control_port: u16,
}

impl DiscoveryConfig {
    pub fn new(device_name: impl Into<String>, control_port: u16, discovery_port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], discovery_port)),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], discovery_port)),
            device_name: device_name.into(),
            control_port,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new("SoundLink", DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT)
    }
}

/// A published discovery service.
pub struct DiscoveryResponder {
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    running: Arc<AtomicBool>,
    published: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DiscoveryResponder {
    /// Binds the discovery socket, broadcasts an announcement, and starts
    /// answering probes.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::BindFailed`] if the socket cannot be bound.
    pub fn start(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(config.bind_addr).map_err(|source| {
            DiscoveryError::BindFailed {
                addr: config.bind_addr,
                source,
            }
        })?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let socket = Arc::new(socket);

        let running = Arc::new(AtomicBool::new(true));
        let published = Arc::new(AtomicBool::new(false));
        let thread = {
            let socket = Arc::clone(&socket);
            let running = Arc::clone(&running);
            let published = Arc::clone(&published);
            let name = config.device_name.clone();
            let port = config.control_port;
            std::thread::Builder::new()
                .name("soundlink-discovery".to_string())
                .spawn(move || responder_loop(&socket, &name, port, &running, &published))?
        };

        let responder = Self {
            socket,
            config,
            running,
            published,
            thread: Some(thread),
        };
        info!(
            "discovery responder on UDP {} advertising \"{}\" (control port {})",
            responder.local_addr().unwrap_or(responder.config.bind_addr),
            responder.config.device_name,
            responder.config.control_port
        );
        responder.publish();
        Ok(responder)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Broadcasts an `announce` datagram and answers probes from now on.
    pub fn publish(&self) {
        self.published.store(true, Ordering::Relaxed);
        let announce =
            DiscoveryDatagram::announce(self.config.device_name.clone(), self.config.control_port);
        send_datagram(&self.socket, &announce, self.config.broadcast_addr);
    }

    /// Broadcasts `goodbye` and stops answering probes.
    ///
    /// Does nothing if the service is not currently published.
    pub fn unpublish(&self) {
        if !self.published.swap(false, Ordering::Relaxed) {
            return;
        }
        let goodbye = DiscoveryDatagram::goodbye(self.config.device_name.clone());
        send_datagram(&self.socket, &goodbye, self.config.broadcast_addr);
    }

    /// Unpublishes and stops the responder thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.unpublish();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("discovery thread panicked");
            }
        }
        info!("discovery responder stopped");
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn responder_loop(
    socket: &UdpSocket,
    name: &str,
    control_port: u16,
    running: &AtomicBool,
    published: &AtomicBool,
) {
    let mut buf = vec![0u8; 2048];

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("discovery recv error: {e}");
                continue;
            }
        };

        match DiscoveryDatagram::from_bytes(&buf[..len]) {
            Ok(datagram) if !datagram.is_ours() => {
                debug!("ignoring datagram for another service from {src}");
            }
            Ok(DiscoveryDatagram::Probe { .. }) if !published.load(Ordering::Relaxed) => {
                debug!("unpublished; ignoring probe from {src}");
            }
            Ok(DiscoveryDatagram::Probe { .. }) => {
                debug!("probe from {src}");
                send_datagram(
                    socket,
                    &DiscoveryDatagram::announce(name, control_port),
                    src,
                );
            }
            // Our own broadcasts and other servers' announcements.
            Ok(_) => {}
            Err(e) => debug!("undecodable discovery datagram from {src}: {e}"),
        }
    }
}

fn send_datagram(socket: &UdpSocket, datagram: &DiscoveryDatagram, dest: SocketAddr) {
    match datagram.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, dest) {
                warn!("failed to send discovery datagram to {dest}: {e}");
            }
        }
        Err(e) => error!("failed to encode discovery datagram: {e}"),
    }
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
