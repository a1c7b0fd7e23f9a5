//! SoundLink server entry point.
//!
//! Loads the configuration, builds every service, and runs until Ctrl-C.
//!
//! ```text
//! soundlink-server                          # serve the stored catalog
//! soundlink-server --import ~/Music/a.mp3   # add local files, then serve
//! ```
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load server.toml        -- ports, device name, storage dir
//!  └─ build adapters
//!       ├─ LocalFileStore          (audio files on disk)
//!       ├─ TomlSettingsRepository  (catalog, volume, loop)
//!       └─ HeadlessEngine          (position ticker)
//!  └─ start services
//!       ├─ ControlServer        (TCP, one reader + writer per controller)
//!       ├─ Dispatcher           (single task owning all state)
//!       ├─ TransferServer       (TCP, one task per upload)
//!       └─ DiscoveryResponder   (UDP background thread)
//! ```
//!
//! Every service feeds the same event channel, and the dispatcher is the only
//! consumer.  That single consumer is what keeps the playback state
//! consistent no matter how many controllers are connected.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use soundlink_server::application::dispatch::{Dispatcher, ServerEvent};
use soundlink_server::application::storage::{FileStore, SettingsRepository};
use soundlink_server::infrastructure::network::control_server::{
    ControlServer, ControlServerConfig,
};
use soundlink_server::infrastructure::network::discovery::{DiscoveryConfig, DiscoveryResponder};
use soundlink_server::infrastructure::network::transfer_server::{
    TransferServer, TransferServerConfig,
};
use soundlink_server::infrastructure::playback::headless::HeadlessEngine;
use soundlink_server::infrastructure::storage::config::{
    config_dir, load_config, save_config, ServerConfig, CONFIG_FILE_NAME,
};
use soundlink_server::infrastructure::storage::file_store::LocalFileStore;
use soundlink_server::infrastructure::storage::settings::{
    InMemorySettingsRepository, TomlSettingsRepository,
};

const EVENT_CHANNEL_DEPTH: usize = 1024;

/// SoundLink playback server.
#[derive(Debug, Parser)]
#[command(name = "soundlink-server", version)]
struct Cli {
    /// Audio file to copy into the store and add to the catalog (repeatable).
    #[arg(long = "import", value_name = "PATH")]
    imports: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let dir = config_dir().ok();
    let config = match &dir {
        Some(dir) => load_config(&dir.join(CONFIG_FILE_NAME))
            .with_context(|| format!("loading {}", dir.join(CONFIG_FILE_NAME).display()))?,
        None => ServerConfig::default(),
    };

    // Level from the config file unless overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!("SoundLink server \"{}\" starting", config.server.device_name);
    match &dir {
        Some(dir) if !dir.join(CONFIG_FILE_NAME).exists() => {
            // First run: leave an editable copy of the defaults behind.
            let path = dir.join(CONFIG_FILE_NAME);
            match save_config(&path, &config) {
                Ok(()) => info!("wrote default configuration to {}", path.display()),
                Err(e) => warn!("could not write {}: {e}", path.display()),
            }
        }
        Some(_) => {}
        None => warn!("no platform config directory; using defaults and in-memory settings"),
    }

    // ── Adapters ──────────────────────────────────────────────────────────────
    let storage_dir = match &dir {
        Some(dir) => config.storage_dir(dir),
        None => config
            .server
            .storage_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("soundlink-files")),
    };
    let store = LocalFileStore::new(&storage_dir);
    store
        .ensure_root()
        .await
        .with_context(|| format!("creating storage directory {}", storage_dir.display()))?;
    info!("audio files stored in {}", storage_dir.display());
    let store: Arc<dyn FileStore> = Arc::new(store);

    let settings: Arc<dyn SettingsRepository> = match &dir {
        Some(dir) => Arc::new(TomlSettingsRepository::in_dir(dir)),
        None => Arc::new(InMemorySettingsRepository::default()),
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    let engine = Arc::new(HeadlessEngine::new(events_tx.clone()));

    // ── Control channel + dispatcher ──────────────────────────────────────────
    let control = ControlServer::start(
        ControlServerConfig {
            bind_addr: config.network.control_addr()?,
            outbound_queue_depth: config.network.outbound_queue_depth,
        },
        events_tx.clone(),
    )
    .await
    .context("starting control server")?;

    let dispatcher = Dispatcher::load(
        engine,
        Arc::clone(&store),
        settings,
        Arc::new(control.handle()),
        config.server.max_file_size,
    )
    .await
    .context("loading settings")?;
    let dispatcher_task = tokio::spawn(dispatcher.run(events_rx));
    for path in cli.imports {
        info!("importing {}", path.display());
        events_tx
            .send(ServerEvent::Import(path))
            .await
            .context("queueing import")?;
    }

    // ── Transfer channel ──────────────────────────────────────────────────────
    let transfer = TransferServer::start(
        TransferServerConfig {
            bind_addr: config.network.transfer_addr()?,
            max_file_size: config.server.max_file_size,
        },
        store,
        events_tx.clone(),
    )
    .await
    .context("starting transfer server")?;
    drop(events_tx);

    // ── Discovery ─────────────────────────────────────────────────────────────
    let discovery = match DiscoveryResponder::start(DiscoveryConfig {
        bind_addr: config.network.discovery_addr()?,
        broadcast_addr: config.network.discovery_broadcast_addr(),
        device_name: config.server.device_name.clone(),
        control_port: control.local_addr().port(),
    }) {
        Ok(responder) => Some(responder),
        Err(e) => {
            // Controllers can still connect by IP.
            error!("failed to start discovery responder: {e}");
            None
        }
    };

    info!(
        "SoundLink server ready (control {}, transfer {}).  Press Ctrl-C to exit.",
        control.local_addr(),
        transfer.local_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    // ── Shutdown ──────────────────────────────────────────────────────────────
    if let Some(discovery) = discovery {
        discovery.stop();
    }
    transfer.stop().await;
    control.stop().await;
    // The engine holds an event sender, so the dispatcher never sees the
    // channel close on its own.
    dispatcher_task.abort();

    info!("SoundLink server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
