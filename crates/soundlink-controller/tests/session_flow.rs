//! Controller sessions against a real in-process server.
//!
//! Each test starts the server's control listener, transfer listener and
//! dispatcher on loopback ports, then drives them through
//! [`RemoteSession`] the way the CLI does.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use soundlink_controller::application::events::{ClientEvent, ConnectionStatus};
use soundlink_controller::infrastructure::network::{
    ClientConfig, ControllerClient, RemoteSession, SessionError,
};
use soundlink_core::domain::transfer::stored_file_name;
use soundlink_core::{ControllerMsg, ErrorCode, FileInfo, PlaybackStatus, ServerMsg};
use soundlink_server::application::dispatch::Dispatcher;
use soundlink_server::application::storage::{FileStore, PersistedSettings};
use soundlink_server::infrastructure::network::control_server::{
    ControlServer, ControlServerConfig,
};
use soundlink_server::infrastructure::network::transfer_server::{
    TransferServer, TransferServerConfig,
};
use soundlink_server::infrastructure::playback::headless::HeadlessEngine;
use soundlink_server::infrastructure::storage::file_store::LocalFileStore;
use soundlink_server::infrastructure::storage::settings::InMemorySettingsRepository;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

// ── Harness ───────────────────────────────────────────────────────────────────

struct TestServer {
    control: ControlServer,
    transfer: TransferServer,
    store_dir: PathBuf,
    dispatcher: JoinHandle<()>,
}

impl TestServer {
    async fn start(seed: Vec<FileInfo>, max_file_size: u64) -> Self {
        let store_dir = std::env::temp_dir().join(format!("soundlink-ctl-{}", Uuid::new_v4()));
        let store = LocalFileStore::new(&store_dir);
        store.ensure_root().await.unwrap();
        for file in &seed {
            let path = store.path_for(&stored_file_name(&file.id, &file.name));
            std::fs::write(path, vec![0u8; file.size as usize]).unwrap();
        }
        let store: Arc<dyn FileStore> = Arc::new(store);
        let settings = Arc::new(InMemorySettingsRepository::new(PersistedSettings {
            files: seed,
            ..PersistedSettings::default()
        }));

        let (tx, rx) = mpsc::channel(256);
        let engine = Arc::new(HeadlessEngine::new(tx.clone()).with_tick(Duration::from_secs(3600)));
        let control = ControlServer::start(
            ControlServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                ..ControlServerConfig::default()
            },
            tx.clone(),
        )
        .await
        .unwrap();
        let dispatcher = Dispatcher::load(
            engine,
            Arc::clone(&store),
            settings,
            Arc::new(control.handle()),
            max_file_size,
        )
        .await
        .unwrap();
        let dispatcher = tokio::spawn(dispatcher.run(rx));
        let transfer = TransferServer::start(
            TransferServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                max_file_size,
            },
            store,
            tx,
        )
        .await
        .unwrap();

        Self {
            control,
            transfer,
            store_dir,
            dispatcher,
        }
    }

    fn control_port(&self) -> u16 {
        self.control.local_addr().port()
    }

    fn transfer_port(&self) -> u16 {
        self.transfer.local_addr().port()
    }

    async fn session(&self) -> RemoteSession {
        RemoteSession::open("127.0.0.1", self.control_port(), ClientConfig::default(), WAIT)
            .await
            .unwrap()
    }

    async fn shutdown(self) {
        self.transfer.stop().await;
        self.control.stop().await;
        self.dispatcher.abort();
        let _ = std::fs::remove_dir_all(&self.store_dir);
    }
}

fn seed_file(id: &str) -> FileInfo {
    FileInfo {
        id: id.to_string(),
        name: format!("{id}.mp3"),
        size: 32,
        duration: Some(90.0),
        added_at: 1_700_000_000_000,
    }
}

fn is_state(m: &ServerMsg) -> bool {
    matches!(m, ServerMsg::PlaybackState { .. })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_open_mirrors_the_snapshot() {
    // Arrange
    let server = TestServer::start(vec![seed_file("a"), seed_file("b")], u64::MAX).await;

    // Act
    let session = server.session().await;

    // Assert
    let mirror = session.mirror();
    assert_eq!(mirror.status, ConnectionStatus::Connected);
    assert_eq!(mirror.files.len(), 2);
    assert_eq!(
        mirror.playback.as_ref().map(|p| p.status),
        Some(PlaybackStatus::Stopped)
    );
    assert_eq!(mirror.power_saving, Some(false));
    session.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_play_then_pause_is_reflected_in_mirror() {
    // Arrange
    let server = TestServer::start(vec![seed_file("a")], u64::MAX).await;
    let mut session = server.session().await;

    // Act
    session
        .request(
            ControllerMsg::Play {
                file_id: "a".to_string(),
            },
            "PLAYBACK_STATE",
            WAIT,
            is_state,
        )
        .await
        .unwrap();
    let playing = session.mirror().playback.clone().unwrap();
    session
        .request(ControllerMsg::Pause, "PLAYBACK_STATE", WAIT, is_state)
        .await
        .unwrap();

    // Assert
    assert_eq!(playing.status, PlaybackStatus::Playing);
    assert_eq!(playing.duration_ms, 90_000);
    assert_eq!(
        session.mirror().current_file().map(|f| f.id.as_str()),
        Some("a")
    );
    assert_eq!(
        session.mirror().playback.as_ref().map(|p| p.status),
        Some(PlaybackStatus::Paused)
    );
    session.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_play_unknown_file_fails_with_server_error() {
    let server = TestServer::start(vec![], u64::MAX).await;
    let mut session = server.session().await;

    let result = session
        .request(
            ControllerMsg::Play {
                file_id: "ghost".to_string(),
            },
            "PLAYBACK_STATE",
            WAIT,
            is_state,
        )
        .await;

    assert!(matches!(
        result,
        Err(SessionError::Server {
            code: ErrorCode::FileNotFound,
            ..
        })
    ));
    session.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_a_second_session() {
    // Arrange
    let server = TestServer::start(vec![], u64::MAX).await;
    let mut first = server.session().await;
    let mut second = server.session().await;

    // Act
    first
        .request(
            ControllerMsg::SetVolume { volume: 1.7 },
            "PLAYBACK_STATE",
            WAIT,
            is_state,
        )
        .await
        .unwrap();
    second
        .wait_until("volume change", WAIT, |m| {
            m.playback.as_ref().is_some_and(|p| p.volume == 1.0)
        })
        .await
        .unwrap();

    // Assert
    assert_eq!(first.mirror().playback, second.mirror().playback);
    first.close();
    second.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_seek_confirmed_by_ping() {
    let server = TestServer::start(vec![seed_file("a")], u64::MAX).await;
    let mut session = server.session().await;

    let result = session
        .fire(ControllerMsg::Seek { position_ms: 5_000 }, WAIT)
        .await;

    assert!(result.is_ok());
    session.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_upload_adds_file_to_catalog() {
    // Arrange
    let server = TestServer::start(vec![], u64::MAX).await;
    let mut session = server.session().await;
    let dir = std::env::temp_dir().join(format!("soundlink-src-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("rain.wav");
    std::fs::write(&path, vec![7u8; 150_000]).unwrap();
    let mut progress = Vec::new();

    // Act
    let file_id = session
        .upload(&path, server.transfer_port(), WAIT, |p| progress.push(p))
        .await
        .unwrap();

    // Assert
    let stored = session.mirror().file(&file_id).cloned().unwrap();
    assert_eq!(stored.name, "rain.wav");
    assert_eq!(stored.size, 150_000);
    assert_eq!(progress.len(), 3);
    assert_eq!(progress.last().copied(), Some(1.0));
    let on_disk = server.store_dir.join(stored_file_name(&file_id, "rain.wav"));
    assert_eq!(std::fs::metadata(on_disk).unwrap().len(), 150_000);
    session.close();
    server.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_upload_over_limit_is_refused_before_sending() {
    // Arrange
    let server = TestServer::start(vec![], 100).await;
    let mut session = server.session().await;
    let dir = std::env::temp_dir().join(format!("soundlink-src-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("big.mp3");
    std::fs::write(&path, vec![1u8; 1_000]).unwrap();
    let mut calls = 0;

    // Act
    let result = session
        .upload(&path, server.transfer_port(), WAIT, |_| calls += 1)
        .await;

    // Assert
    assert!(matches!(result, Err(SessionError::Refused { reason: Some(_) })));
    assert_eq!(calls, 0);
    assert!(session.mirror().files.is_empty());
    session.close();
    server.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_delete_removes_file_from_mirror() {
    let server = TestServer::start(vec![seed_file("a"), seed_file("b")], u64::MAX).await;
    let mut session = server.session().await;

    session
        .request(
            ControllerMsg::DeleteFile {
                file_id: "a".to_string(),
            },
            "FILE_LIST",
            WAIT,
            |m| matches!(m, ServerMsg::FileList { .. }),
        )
        .await
        .unwrap();

    assert!(session.mirror().file("a").is_none());
    assert!(session.mirror().file("b").is_some());
    session.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_round_trip_through_client() {
    let server = TestServer::start(vec![], u64::MAX).await;
    let session = server.session().await;

    let rtt = session.client().ping(WAIT).await.unwrap();

    assert!(rtt < WAIT);
    session.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_open_against_closed_port_reports_closed() {
    // Arrange: grab a free port and release it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    // Act
    let result = RemoteSession::open("127.0.0.1", port, ClientConfig::default(), WAIT).await;

    // Assert
    assert!(matches!(result, Err(SessionError::Closed { cause: Some(_) })));
}

#[tokio::test]
async fn test_server_shutdown_is_seen_by_client() {
    // Arrange
    let server = TestServer::start(vec![], u64::MAX).await;
    let client = ControllerClient::default();
    let mut events = client.connect("127.0.0.1", server.control_port());
    // The first snapshot message means the server has registered us.
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, ClientEvent::Message(_)) {
            break;
        }
    }

    // Act
    server.shutdown().await;

    // Assert: drain until the connection ends
    let mut last = None;
    while let Ok(Some(event)) = tokio::time::timeout(WAIT, events.recv()).await {
        if let ClientEvent::Status { status, .. } = event {
            last = Some(status);
        }
    }
    assert!(matches!(
        last,
        Some(ConnectionStatus::Disconnected | ConnectionStatus::Error)
    ));
}
