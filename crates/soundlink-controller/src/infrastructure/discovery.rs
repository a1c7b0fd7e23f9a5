//! LAN browser for SoundLink servers.
//!
//! The browser broadcasts a `probe` datagram every few seconds and listens
//! for `announce` and `goodbye` answers.  Every server it hears becomes a
//! [`DiscoveredDevice`] keyed by its advertised name:
//!
//! - A name seen for the first time (or seen again at a new address or port)
//!   produces [`BrowseEvent::Found`].
//! - A `goodbye`, or silence for longer than the TTL, produces
//!   [`BrowseEvent::Removed`].
//!
//! The bookkeeping lives in [`DeviceTable`], which has no I/O and is tested on
//! its own.  [`DiscoveryBrowser`] is the thin tokio task that feeds it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use soundlink_core::domain::discovery::DiscoveryDatagram;
use soundlink_core::protocol::DEFAULT_DISCOVERY_PORT;
use soundlink_core::DiscoveredDevice;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error type for the discovery browser.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind browse socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A change in the set of visible servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum BrowseEvent {
    Found(DiscoveredDevice),
    /// The named server went away.
    Removed { name: String },
}

/// Browser settings.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub bind_addr: SocketAddr,
    /// Where probes are sent.
    pub probe_addr: SocketAddr,
    pub probe_interval: Duration,
    /// A server not heard from for this long is dropped.
    pub ttl: Duration,
}

impl BrowserConfig {
    pub fn with_discovery_port(port: u16) -> Self {
        Self {
            probe_addr: SocketAddr::from(([255, 255, 255, 255], port)),
            ..Self::default()
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            probe_addr: SocketAddr::from(([255, 255, 255, 255], DEFAULT_DISCOVERY_PORT)),
            probe_interval: Duration::from_secs(3),
            ttl: Duration::from_secs(10),
        }
    }
}

// ── DeviceTable ───────────────────────────────────────────────────────────────

/// Devices currently visible, keyed by name, with the time each was last
/// heard.
#[derive(Debug, Default)]
pub struct DeviceTable {
    entries: HashMap<String, (DiscoveredDevice, Instant)>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announcement heard at `now`.
    ///
    /// Returns `Found` when the device is new or its address changed.
    pub fn observe(&mut self, device: DiscoveredDevice, now: Instant) -> Option<BrowseEvent> {
        match self.entries.get_mut(&device.name) {
            Some((known, seen)) if *known == device => {
                *seen = now;
                None
            }
            _ => {
                self.entries
                    .insert(device.name.clone(), (device.clone(), now));
                Some(BrowseEvent::Found(device))
            }
        }
    }

    pub fn forget(&mut self, name: &str) -> Option<BrowseEvent> {
        self.entries
            .remove(name)
            .map(|(device, _)| BrowseEvent::Removed { name: device.name })
    }

    /// Drops every device not heard from within `ttl` of `now`.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<BrowseEvent> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (_, seen))| now.saturating_duration_since(*seen) > ttl)
            .map(|(name, _)| name.clone())
            .collect();
        stale.iter().filter_map(|name| self.forget(name)).collect()
    }

    /// Visible devices sorted by name.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.entries.values().map(|(d, _)| d.clone()).collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── DiscoveryBrowser ──────────────────────────────────────────────────────────

/// A running browse task.
pub struct DiscoveryBrowser {
    local_addr: SocketAddr,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl DiscoveryBrowser {
    /// Binds the browse socket and starts probing.
    ///
    /// Events arrive on the returned receiver until [`Self::stop`] is called
    /// or the browser is dropped.
    pub async fn start(
        config: BrowserConfig,
    ) -> Result<(Self, mpsc::Receiver<BrowseEvent>), DiscoveryError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| DiscoveryError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;

        let (tx, rx) = mpsc::channel(64);
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(browse_loop(socket, config, tx, Arc::clone(&stop)));

        info!("browsing for SoundLink servers from {local_addr}");
        Ok((
            Self {
                local_addr,
                stop,
                task,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops probing and waits for the task to end.
    pub async fn stop(mut self) {
        self.stop.notify_one();
        let _ = (&mut self.task).await;
    }
}

impl Drop for DiscoveryBrowser {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn browse_loop(
    socket: UdpSocket,
    config: BrowserConfig,
    events: mpsc::Sender<BrowseEvent>,
    stop: Arc<Notify>,
) {
    let probe = match DiscoveryDatagram::probe().to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("could not encode probe: {e}");
            return;
        }
    };
    let mut table = DeviceTable::new();
    let mut ticker = tokio::time::interval(config.probe_interval);
    let mut buf = vec![0u8; 2048];

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&probe, config.probe_addr).await {
                    warn!("probe to {} failed: {e}", config.probe_addr);
                }
                for event in table.expire(Instant::now(), config.ttl) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("browse recv error: {e}");
                        continue;
                    }
                };
                if let Some(event) = handle_datagram(&mut table, &buf[..len], src) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!("browser stopped");
}

fn handle_datagram(table: &mut DeviceTable, bytes: &[u8], src: SocketAddr) -> Option<BrowseEvent> {
    match DiscoveryDatagram::from_bytes(bytes) {
        Ok(datagram) if !datagram.is_ours() => None,
        Ok(DiscoveryDatagram::Announce { name, port, .. }) => {
            let device = DiscoveredDevice {
                name,
                host: src.ip().to_string(),
                address: src.ip(),
                port,
            };
            table.observe(device, Instant::now())
        }
        Ok(DiscoveryDatagram::Goodbye { name, .. }) => table.forget(&name),
        // Our own probe echoed back by the broadcast.
        Ok(DiscoveryDatagram::Probe { .. }) => None,
        Err(e) => {
            debug!("unreadable datagram from {src}: {e}");
            None
        }
    }
}

/// Browses for `wait` and returns every device seen and still present.
pub async fn discover_for(
    config: BrowserConfig,
    wait: Duration,
) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    let (browser, mut rx) = DiscoveryBrowser::start(config).await?;
    let mut table = DeviceTable::new();
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = rx.recv() => match event {
                Some(BrowseEvent::Found(device)) => {
                    table.observe(device, Instant::now());
                }
                Some(BrowseEvent::Removed { name }) => {
                    table.forget(&name);
                }
                None => break,
            },
        }
    }
    browser.stop().await;
    Ok(table.devices())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
