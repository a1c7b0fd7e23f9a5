//! SoundLink controller command-line tool.
//!
//! Finds servers on the LAN and drives them:
//!
//! ```text
//! soundlink-controller discover
//! soundlink-controller --host 192.168.1.20 files
//! soundlink-controller play <file-id>
//! soundlink-controller upload ./lullaby.mp3
//! soundlink-controller watch
//! ```
//!
//! Without `--host` the first server found by discovery is used.  A host
//! may be given as `ip` or `ip:port`; the port defaults to `--port`.
//!
//! Every command opens one control session, waits for the server's
//! snapshot, sends its request, and waits for the server to confirm it.
//! The server is authoritative: what is printed is always what the server
//! broadcast back, never what was asked for.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use soundlink_controller::application::events::ClientEvent;
use soundlink_controller::application::mirror::ServerMirror;
use soundlink_controller::infrastructure::discovery::{
    discover_for, BrowseEvent, BrowserConfig, DiscoveryBrowser,
};
use soundlink_controller::infrastructure::network::{ClientConfig, RemoteSession};
use soundlink_core::protocol::{
    DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT, DEFAULT_TRANSFER_PORT,
};
use soundlink_core::{ControllerMsg, DiscoveredDevice, PlaybackState, ServerMsg};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Remote control for SoundLink playback servers.
#[derive(Debug, Parser)]
#[command(name = "soundlink-controller", version)]
struct Cli {
    /// Server address (`ip` or `ip:port`).  Discovered when omitted.
    #[arg(long, env = "SOUNDLINK_HOST")]
    host: Option<String>,

    /// Control port, used when `--host` has no port.
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT, env = "SOUNDLINK_PORT")]
    port: u16,

    /// Transfer port for uploads.
    #[arg(long, default_value_t = DEFAULT_TRANSFER_PORT, env = "SOUNDLINK_TRANSFER_PORT")]
    transfer_port: u16,

    /// UDP port servers answer discovery probes on.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Seconds to wait for each server reply.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print machine-readable JSON instead of text.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List servers on the LAN.
    Discover {
        /// Seconds to browse.
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },
    /// Print the server's file catalog.
    Files,
    /// Print the current playback state.
    Status,
    /// Play a file from the beginning.
    Play { file_id: String },
    Pause,
    Stop,
    /// Set the volume (0.0 to 1.0; the server clamps).
    Volume { level: f64 },
    /// Turn looping on or off.
    Loop {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Jump to a position in milliseconds.
    Seek { position_ms: u64 },
    /// Delete a file from the server.
    Delete { file_id: String },
    /// Upload an audio file.
    Upload { path: PathBuf },
    /// Measure round-trip time.
    Ping,
    /// Turn the server's power-saving mode on or off.
    PowerSaving {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Print every server message until Ctrl-C.
    Watch,
}

impl Cli {
    fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn browser_config(&self) -> BrowserConfig {
        BrowserConfig::with_discovery_port(self.discovery_port)
    }

    /// Resolves `--host` or, without it, the first discovered server.
    async fn target(&self) -> anyhow::Result<DiscoveredDevice> {
        if let Some(host) = &self.host {
            return parse_host(host, self.port);
        }
        let devices = discover_for(self.browser_config(), Duration::from_secs(3))
            .await
            .context("browsing for servers")?;
        match devices.as_slice() {
            [] => bail!("no SoundLink server found; pass --host"),
            [only] => Ok(only.clone()),
            [first, ..] => {
                warn!(
                    "{} servers found; using \"{}\" (pass --host to choose)",
                    devices.len(),
                    first.name
                );
                Ok(first.clone())
            }
        }
    }
}

fn parse_host(host: &str, default_port: u16) -> anyhow::Result<DiscoveredDevice> {
    let mut device = DiscoveredDevice::manual(host)
        .with_context(|| format!("invalid host '{host}' (expected ip or ip:port)"))?;
    if host.trim().parse::<SocketAddr>().is_err() {
        device.port = default_port;
    }
    Ok(device)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match &cli.command {
        Command::Discover { wait } => discover(&cli, Duration::from_secs(*wait)).await,
        Command::Watch => watch(&cli).await,
        _ => run_command(&cli).await,
    }
}

async fn discover(cli: &Cli, wait: Duration) -> anyhow::Result<()> {
    let devices = discover_for(cli.browser_config(), wait)
        .await
        .context("browsing for servers")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("no servers found");
    } else {
        for d in &devices {
            println!("{:<24} {}", d.name, d.socket_addr());
        }
    }
    Ok(())
}

async fn open_session(cli: &Cli) -> anyhow::Result<RemoteSession> {
    let target = cli.target().await?;
    info!("connecting to \"{}\" at {}", target.name, target.socket_addr());
    RemoteSession::open(
        target.address.to_string(),
        target.port,
        ClientConfig::default(),
        cli.reply_timeout(),
    )
    .await
    .with_context(|| format!("connecting to {}", target.socket_addr()))
}

async fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let mut session = open_session(cli).await?;
    let wait = cli.reply_timeout();
    let is_state = |m: &ServerMsg| matches!(m, ServerMsg::PlaybackState { .. });

    match &cli.command {
        Command::Files => {
            session
                .request(ControllerMsg::GetFileList, "FILE_LIST", wait, |m| {
                    matches!(m, ServerMsg::FileList { .. })
                })
                .await?;
            print_files(cli, session.mirror())?;
        }
        Command::Status => print_state(cli, session.mirror())?,
        Command::Play { file_id } => {
            let msg = ControllerMsg::Play {
                file_id: file_id.clone(),
            };
            session.request(msg, "PLAYBACK_STATE", wait, is_state).await?;
            print_state(cli, session.mirror())?;
        }
        Command::Pause => {
            session
                .request(ControllerMsg::Pause, "PLAYBACK_STATE", wait, is_state)
                .await?;
            print_state(cli, session.mirror())?;
        }
        Command::Stop => {
            session
                .request(ControllerMsg::Stop, "PLAYBACK_STATE", wait, is_state)
                .await?;
            print_state(cli, session.mirror())?;
        }
        Command::Volume { level } => {
            let msg = ControllerMsg::SetVolume { volume: *level };
            session.request(msg, "PLAYBACK_STATE", wait, is_state).await?;
            print_state(cli, session.mirror())?;
        }
        Command::Loop { enabled } => {
            let msg = ControllerMsg::SetLoop { looping: *enabled };
            session.request(msg, "PLAYBACK_STATE", wait, is_state).await?;
            print_state(cli, session.mirror())?;
        }
        Command::Seek { position_ms } => {
            let msg = ControllerMsg::Seek {
                position_ms: *position_ms,
            };
            session.fire(msg, wait).await?;
            println!("seek to {position_ms} ms sent");
        }
        Command::Delete { file_id } => {
            let msg = ControllerMsg::DeleteFile {
                file_id: file_id.clone(),
            };
            session
                .request(msg, "FILE_LIST", wait, |m| {
                    matches!(m, ServerMsg::FileList { .. })
                })
                .await?;
            print_files(cli, session.mirror())?;
        }
        Command::Upload { path } => {
            let mut last_tenth = 0;
            let file_id = session
                .upload(path, cli.transfer_port, wait, |fraction| {
                    let tenth = (fraction * 10.0) as u32;
                    if tenth > last_tenth {
                        last_tenth = tenth;
                        eprint!("\ruploading {:>3}%", tenth * 10);
                    }
                })
                .await
                .with_context(|| format!("uploading {}", path.display()))?;
            eprintln!();
            println!("{file_id}");
        }
        Command::Ping => {
            let rtt = session.client().ping(wait).await?;
            println!("pong in {} ms", rtt.as_millis());
        }
        Command::PowerSaving { enabled } => {
            let msg = ControllerMsg::SetPowerSaving { enabled: *enabled };
            session
                .request(msg, "POWER_SAVING_STATE", wait, |m| {
                    matches!(m, ServerMsg::PowerSavingState { .. })
                })
                .await?;
            let enabled = session.mirror().power_saving.unwrap_or(false);
            println!("power saving {}", if enabled { "on" } else { "off" });
        }
        Command::Discover { .. } | Command::Watch => bail!("not a session command"),
    }

    session.close();
    Ok(())
}

/// Prints server messages and discovery changes until Ctrl-C.
async fn watch(cli: &Cli) -> anyhow::Result<()> {
    let mut session = open_session(cli).await?;
    print_files(cli, session.mirror())?;
    print_state(cli, session.mirror())?;

    let (browser, mut browse) = match DiscoveryBrowser::start(cli.browser_config()).await {
        Ok((browser, rx)) => (Some(browser), Some(rx)),
        Err(e) => {
            warn!("discovery unavailable: {e}");
            (None, None)
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = session.next_event(Duration::from_secs(3600)) => {
                match event? {
                    Some(ClientEvent::Message(envelope)) => {
                        if cli.json {
                            println!("{}", serde_json::to_string(&envelope)?);
                        } else {
                            println!("{}", describe(&envelope.body));
                        }
                    }
                    Some(ClientEvent::Status { status, cause }) => {
                        println!("connection {status:?}{}", cause.map(|c| format!(": {c}")).unwrap_or_default());
                        if !status.is_connected() {
                            break;
                        }
                    }
                    None => {}
                }
            }
            Some(found) = recv_browse(&mut browse) => print_browse(cli, &found)?,
        }
    }

    if let Some(browser) = browser {
        browser.stop().await;
    }
    session.close();
    Ok(())
}

async fn recv_browse(
    rx: &mut Option<tokio::sync::mpsc::Receiver<BrowseEvent>>,
) -> Option<BrowseEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

fn print_files(cli: &Cli, mirror: &ServerMirror) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&mirror.files)?);
        return Ok(());
    }
    if mirror.files.is_empty() {
        println!("no files");
    }
    for f in &mirror.files {
        println!("{}  {:>10}  {}", f.id, f.size, f.name);
    }
    Ok(())
}

fn print_state(cli: &Cli, mirror: &ServerMirror) -> anyhow::Result<()> {
    let Some(state) = &mirror.playback else {
        return Ok(());
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(());
    }
    let title = mirror
        .current_file()
        .map(|f| f.name.as_str())
        .or(state.current_file_id.as_deref())
        .unwrap_or("-");
    println!("{}", summarize(state, title));
    Ok(())
}

fn print_browse(cli: &Cli, event: &BrowseEvent) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        BrowseEvent::Found(d) => println!("server found: {} at {}", d.name, d.socket_addr()),
        BrowseEvent::Removed { name } => println!("server gone: {name}"),
    }
    Ok(())
}

fn summarize(state: &PlaybackState, title: &str) -> String {
    format!(
        "{:?} {}  {}/{} s  volume {:.0}%{}",
        state.status,
        title,
        state.position_ms / 1000,
        state.duration_ms / 1000,
        state.volume * 100.0,
        if state.looping { "  loop" } else { "" }
    )
}

fn describe(msg: &ServerMsg) -> String {
    match msg {
        ServerMsg::Pong => "PONG".to_string(),
        ServerMsg::FileList { files } => format!("FILE_LIST ({} files)", files.len()),
        ServerMsg::PlaybackState { state } => {
            let title = state.current_file_id.as_deref().unwrap_or("-");
            format!("PLAYBACK_STATE {}", summarize(state, title))
        }
        ServerMsg::FileTransferAck {
            file_id,
            accepted,
            reason,
        } => format!(
            "FILE_TRANSFER_ACK {file_id} {}{}",
            if *accepted { "accepted" } else { "refused" },
            reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
        ),
        ServerMsg::FileTransferDone { file_id, success } => {
            format!("FILE_TRANSFER_DONE {file_id} success={success}")
        }
        ServerMsg::Error { code, message } => format!("ERROR {code:?}: {message}"),
        ServerMsg::PowerSavingState { enabled } => format!("POWER_SAVING_STATE {enabled}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
