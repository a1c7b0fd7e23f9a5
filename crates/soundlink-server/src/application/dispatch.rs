//! Dispatcher: the single owner of the server's authoritative state.
//!
//! # One task, one queue
//!
//! Every input the server reacts to arrives on one `mpsc` channel as a
//! [`ServerEvent`]:
//!
//! ```text
//!  control sessions ──┐
//!  playback engine ───┤
//!  transfer receiver ─┼──▶ mpsc<ServerEvent> ──▶ Dispatcher::run()
//!  local imports ─────┘                              │
//!                                                    ├─ mutate catalog / playback state
//!                                                    └─ send_to(session) / broadcast()
//! ```
//!
//! The dispatcher handles one event completely (state change *and* the
//! resulting messages) before it looks at the next.  Two controllers pressing
//! buttons at the same moment therefore never interleave half-applied
//! updates, and no lock is needed around the state.
//!
//! # Reply rules
//!
//! | Request            | Reply                                               |
//! |--------------------|-----------------------------------------------------|
//! | `PING`             | `PONG` (same id) to the sender                      |
//! | `GET_FILE_LIST`    | `FILE_LIST` to the sender                           |
//! | `PLAY` unknown id  | `ERROR FILE_NOT_FOUND` to the sender, no change     |
//! | `PLAY`, `PAUSE`, `STOP`, `SET_VOLUME`, `SET_LOOP` | `PLAYBACK_STATE` to all |
//! | `SEEK`             | nothing                                             |
//! | `DELETE_FILE`      | `FILE_LIST` to all (plus `PLAYBACK_STATE` if it was playing) |
//! | `FILE_TRANSFER_START` | `FILE_TRANSFER_ACK` to the sender                |
//! | `SET_POWER_SAVING` | `POWER_SAVING_STATE` to all                         |
//!
//! An engine failure on `PLAY`, `PAUSE` or `SEEK` reverts the state to
//! `stopped`, which is then broadcast.
//!
//! # Engine events
//!
//! Engine events are applied only while their generation matches the one
//! returned by the last successful `play`.  Pause, stop and failures clear
//! the active generation, so an event queued behind one of those commands
//! is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use soundlink_core::domain::transfer::{stored_file_name, TransferHeader};
use soundlink_core::protocol::messages::{ControllerEnvelope, ServerEnvelope};
use soundlink_core::protocol::now_millis;
use soundlink_core::{
    ControllerMsg, Envelope, ErrorCode, FileCatalog, FileInfo, PlaybackState, ServerMsg,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::engine::{EngineEvent, PlaybackEngine, PlaybackGeneration};
use crate::application::storage::{
    copy_into_store, FileStore, FileStoreError, ImportError, SettingsError, SettingsPatch,
    SettingsRepository,
};

/// Identifies one control connection: `"remoteAddress:remotePort"`.
pub type SessionId = String;

/// Error type for dispatcher construction.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to load settings: {0}")]
    Settings(#[from] SettingsError),
}

/// Lifecycle and traffic of one control session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A controller connected; it has not been sent anything yet.
    Connected(SessionId),
    /// A decoded message arrived from the session.
    Message {
        session: SessionId,
        message: ControllerEnvelope,
    },
    /// The connection closed (by either side).
    Disconnected(SessionId),
}

/// Everything the dispatcher reacts to.
#[derive(Debug)]
pub enum ServerEvent {
    Session(SessionEvent),
    Engine {
        generation: PlaybackGeneration,
        event: EngineEvent,
    },
    /// The transfer receiver finished with a connection.  `Ok` carries the
    /// number of bytes stored.
    TransferFinished {
        header: TransferHeader,
        result: Result<u64, String>,
    },
    /// Add a file from the server's own file system to the catalog.
    Import(PathBuf),
}

/// Outbound side of the control server, as seen by the dispatcher.
pub trait MessageSink: Send + Sync {
    /// Queues `message` for one session.  Returns `false` if the session is
    /// gone or could not take it.
    fn send_to(&self, session: &str, message: &ServerEnvelope) -> bool;

    /// Queues `message` for every session.  Returns how many accepted it.
    fn broadcast(&self, message: &ServerEnvelope) -> usize;
}

/// Owns the catalog and playback state and applies every [`ServerEvent`].
pub struct Dispatcher {
    engine: Arc<dyn PlaybackEngine>,
    files: Arc<dyn FileStore>,
    settings: Arc<dyn SettingsRepository>,
    sink: Arc<dyn MessageSink>,
    catalog: FileCatalog,
    playback: PlaybackState,
    /// Generation of the engine playback the state follows, if any.
    active_generation: Option<PlaybackGeneration>,
    power_saving: bool,
    max_file_size: u64,
}

impl Dispatcher {
    /// Builds the dispatcher from persisted settings.
    ///
    /// Catalog entries whose file has disappeared from the store are dropped
    /// (and the pruned catalog is saved back).
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Settings`] if the settings cannot be read.
    pub async fn load(
        engine: Arc<dyn PlaybackEngine>,
        files: Arc<dyn FileStore>,
        settings: Arc<dyn SettingsRepository>,
        sink: Arc<dyn MessageSink>,
        max_file_size: u64,
    ) -> Result<Self, DispatchError> {
        let stored = settings.load()?;
        let mut catalog = FileCatalog::from_parts(stored.files, stored.last_played_file_id);

        let mut missing = Vec::new();
        for file in catalog.files() {
            if !files.exists(&stored_file_name(&file.id, &file.name)).await {
                missing.push(file.id.clone());
            }
        }
        if !missing.is_empty() {
            warn!("dropping {} catalog entries with no stored file", missing.len());
            catalog.retain(|f| !missing.contains(&f.id));
            let patch = SettingsPatch {
                files: Some(catalog.files().to_vec()),
                last_played_file_id: Some(catalog.last_played_file_id().map(str::to_string)),
                ..SettingsPatch::default()
            };
            if let Err(e) = settings.save(patch) {
                warn!("failed to save pruned catalog: {e}");
            }
        }

        info!(
            "loaded {} files (volume {:.2}, loop {})",
            catalog.len(),
            stored.volume,
            stored.looping
        );

        Ok(Self {
            engine,
            files,
            settings,
            sink,
            catalog,
            playback: PlaybackState::with_settings(stored.volume, stored.looping),
            active_generation: None,
            power_saving: false,
            max_file_size,
        })
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    pub fn power_saving(&self) -> bool {
        self.power_saving
    }

    /// Processes events until every sender is dropped, then stops the engine.
    pub async fn run(mut self, mut events: mpsc::Receiver<ServerEvent>) {
        info!("dispatcher running");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        if let Err(e) = self.engine.stop().await {
            debug!("engine stop on shutdown: {e}");
        }
        info!("dispatcher stopped");
    }

    /// Applies one event, including every message it causes.
    pub async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Session(SessionEvent::Connected(session)) => {
                info!("session {session} connected");
                self.send_snapshot(&session);
            }
            ServerEvent::Session(SessionEvent::Disconnected(session)) => {
                info!("session {session} disconnected");
            }
            ServerEvent::Session(SessionEvent::Message { session, message }) => {
                self.handle_message(&session, message).await;
            }
            ServerEvent::Engine { generation, event } => self.handle_engine_event(generation, event),
            ServerEvent::TransferFinished { header, result } => {
                self.handle_transfer_finished(header, result).await
            }
            ServerEvent::Import(path) => {
                if let Err(e) = self.import_file(&path).await {
                    error!("failed to import {}: {e}", path.display());
                }
            }
        }
    }

    /// Copies a local file into the store under a fresh id, adds it to the
    /// catalog and broadcasts `FILE_LIST`.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`] if the source cannot be read or stored.  The
    /// catalog is unchanged in that case.
    pub async fn import_file(&mut self, source: &Path) -> Result<FileInfo, ImportError> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ImportError::NotAFile(source.to_path_buf()))?;
        let id = Uuid::new_v4().to_string();
        let stored = stored_file_name(&id, &name);
        let size = copy_into_store(self.files.as_ref(), source, &stored).await?;

        let file = FileInfo {
            id,
            name,
            size,
            duration: None,
            added_at: now_millis(),
        };
        info!("imported {} as {} ({size} bytes)", source.display(), file.id);
        self.catalog.insert(file.clone());
        self.persist_catalog().await;
        self.sink.broadcast(&self.file_list());
        Ok(file)
    }

    // ── Control messages ──────────────────────────────────────────────────────

    async fn handle_message(&mut self, session: &str, message: ControllerEnvelope) {
        debug!("session {session} → {}", message.body.kind());

        match message.body {
            ControllerMsg::Ping => {
                self.sink
                    .send_to(session, &Envelope::with_id(message.id, ServerMsg::Pong));
            }
            ControllerMsg::GetFileList => {
                self.sink.send_to(session, &self.file_list());
            }
            ControllerMsg::Play { file_id } => self.play(session, &file_id).await,
            ControllerMsg::Pause => {
                self.active_generation = None;
                match self.engine.pause().await {
                    Ok(()) => {
                        self.playback.pause();
                    }
                    Err(e) => {
                        error!("engine pause failed: {e}");
                        self.playback.fail();
                    }
                }
                self.broadcast_state();
            }
            ControllerMsg::Stop => {
                self.active_generation = None;
                if let Err(e) = self.engine.stop().await {
                    warn!("engine stop failed: {e}");
                }
                self.playback.stop();
                self.broadcast_state();
            }
            ControllerMsg::SetVolume { volume } => {
                let volume = self.playback.set_volume(volume);
                if let Err(e) = self.engine.set_volume(volume).await {
                    warn!("engine set_volume failed: {e}");
                }
                self.persist(SettingsPatch {
                    volume: Some(volume),
                    ..SettingsPatch::default()
                })
                .await;
                self.broadcast_state();
            }
            ControllerMsg::SetLoop { looping } => {
                self.playback.set_loop(looping);
                if let Err(e) = self.engine.set_loop(looping).await {
                    warn!("engine set_loop failed: {e}");
                }
                self.persist(SettingsPatch {
                    looping: Some(looping),
                    ..SettingsPatch::default()
                })
                .await;
                self.broadcast_state();
            }
            ControllerMsg::Seek { position_ms } => match self.engine.seek(position_ms).await {
                Ok(()) => self.playback.seek(position_ms),
                Err(e) => {
                    error!("engine seek failed: {e}");
                    self.active_generation = None;
                    self.playback.fail();
                    self.broadcast_state();
                }
            },
            ControllerMsg::DeleteFile { file_id } => self.delete_file(session, &file_id).await,
            ControllerMsg::FileTransferStart {
                file_id,
                file_name,
                file_size,
            } => {
                let header = TransferHeader::new(file_id, file_name, file_size);
                let reason = header
                    .validate(self.max_file_size)
                    .err()
                    .map(|r| r.to_string());
                if let Some(reason) = &reason {
                    info!("refusing upload {}: {reason}", header.file_id);
                }
                self.sink.send_to(
                    session,
                    &Envelope::new(ServerMsg::FileTransferAck {
                        file_id: header.file_id,
                        accepted: reason.is_none(),
                        reason,
                    }),
                );
            }
            ControllerMsg::SetPowerSaving { enabled } => {
                self.power_saving = enabled;
                self.sink
                    .broadcast(&Envelope::new(ServerMsg::PowerSavingState { enabled }));
            }
        }
    }

    async fn play(&mut self, session: &str, file_id: &str) {
        let Some(file) = self.catalog.get(file_id).cloned() else {
            self.send_error(session, ErrorCode::FileNotFound, format!("unknown file {file_id}"));
            return;
        };

        self.catalog.set_last_played(&file.id);
        self.playback.play(&file);
        self.persist(SettingsPatch {
            last_played_file_id: Some(Some(file.id.clone())),
            ..SettingsPatch::default()
        })
        .await;

        let path = self.files.path_for(&stored_file_name(&file.id, &file.name));
        match self
            .engine
            .play(&path, self.playback.volume, self.playback.looping)
            .await
        {
            Ok(generation) => self.active_generation = Some(generation),
            Err(e) => {
                error!("failed to start {}: {e}", file.id);
                self.active_generation = None;
                self.playback.fail();
            }
        }
        self.broadcast_state();
    }

    async fn delete_file(&mut self, session: &str, file_id: &str) {
        let Some(file) = self.catalog.get(file_id).cloned() else {
            self.send_error(session, ErrorCode::FileNotFound, format!("unknown file {file_id}"));
            return;
        };

        if self.playback.current_file_id.as_deref() == Some(file_id) {
            self.active_generation = None;
            if let Err(e) = self.engine.stop().await {
                warn!("engine stop failed: {e}");
            }
            self.playback.stop();
            self.broadcast_state();
        }

        match self.files.delete(&stored_file_name(&file.id, &file.name)).await {
            Ok(()) | Err(FileStoreError::NotFound(_)) => {}
            Err(e) => {
                error!("failed to delete {file_id}: {e}");
                self.send_error(session, ErrorCode::InternalError, e.to_string());
                return;
            }
        }

        self.catalog.remove(file_id);
        info!("deleted {file_id} ({})", file.name);
        self.persist_catalog().await;
        self.sink.broadcast(&self.file_list());
    }

    // ── Engine and transfer events ────────────────────────────────────────────

    fn handle_engine_event(&mut self, generation: PlaybackGeneration, event: EngineEvent) {
        if self.active_generation != Some(generation) {
            debug!("dropping {event:?} from stale generation {generation}");
            return;
        }
        match event {
            EngineEvent::Position {
                position_ms,
                duration_ms,
            } => {
                if !self.playback.is_playing() {
                    return;
                }
                self.playback.apply_position(position_ms, duration_ms);
                self.broadcast_state();
            }
            EngineEvent::Finished => {
                if self.playback.finish() {
                    debug!("playback finished");
                    self.broadcast_state();
                }
                if !self.playback.is_playing() {
                    self.active_generation = None;
                }
            }
            EngineEvent::Failed(reason) => {
                error!("playback failed: {reason}");
                self.active_generation = None;
                self.playback.fail();
                self.broadcast_state();
            }
        }
    }

    async fn handle_transfer_finished(
        &mut self,
        header: TransferHeader,
        result: Result<u64, String>,
    ) {
        let success = match result {
            Ok(size) => {
                info!("stored {} ({} bytes)", header.file_name, size);
                self.drop_replaced_file(&header).await;
                self.catalog.insert(FileInfo {
                    id: header.file_id.clone(),
                    name: header.file_name.clone(),
                    size,
                    duration: None,
                    added_at: now_millis(),
                });
                self.persist_catalog().await;
                self.sink.broadcast(&self.file_list());
                true
            }
            Err(reason) => {
                warn!("upload {} failed: {reason}", header.file_id);
                false
            }
        };

        self.sink.broadcast(&Envelope::new(ServerMsg::FileTransferDone {
            file_id: header.file_id,
            success,
        }));
    }

    /// Deletes the stored file of an entry that `header` replaces under a
    /// different name.
    async fn drop_replaced_file(&self, header: &TransferHeader) {
        let Some(old) = self.catalog.get(&header.file_id) else {
            return;
        };
        let old_name = stored_file_name(&old.id, &old.name);
        if old_name == header.stored_name() {
            return;
        }
        match self.files.delete(&old_name).await {
            Ok(()) => debug!("removed replaced file {old_name}"),
            Err(FileStoreError::NotFound(_)) => {}
            Err(e) => warn!("could not remove replaced file {old_name}: {e}"),
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn file_list(&self) -> ServerEnvelope {
        Envelope::new(ServerMsg::FileList {
            files: self.catalog.files().to_vec(),
        })
    }

    fn state_message(&self) -> ServerEnvelope {
        Envelope::new(ServerMsg::PlaybackState {
            state: self.playback.clone(),
        })
    }

    fn broadcast_state(&self) {
        let delivered = self.sink.broadcast(&self.state_message());
        debug!(
            "state {:?} broadcast to {delivered} sessions",
            self.playback.status
        );
    }

    fn send_snapshot(&self, session: &str) {
        self.sink.send_to(session, &self.file_list());
        self.sink.send_to(session, &self.state_message());
        self.sink.send_to(
            session,
            &Envelope::new(ServerMsg::PowerSavingState {
                enabled: self.power_saving,
            }),
        );
    }

    fn send_error(&self, session: &str, code: ErrorCode, message: String) {
        warn!("session {session}: {code:?}: {message}");
        self.sink
            .send_to(session, &Envelope::new(ServerMsg::Error { code, message }));
    }

    async fn persist_catalog(&self) {
        self.persist(SettingsPatch {
            files: Some(self.catalog.files().to_vec()),
            last_played_file_id: Some(self.catalog.last_played_file_id().map(str::to_string)),
            ..SettingsPatch::default()
        })
        .await;
    }

    /// Saves `patch` on the blocking pool.  Awaited, so saves land in the
    /// order the events were handled.
    async fn persist(&self, patch: SettingsPatch) {
        let settings = Arc::clone(&self.settings);
        match tokio::task::spawn_blocking(move || settings.save(patch)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("failed to save settings: {e}"),
            Err(e) => error!("settings save task failed: {e}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::{EngineError, MockPlaybackEngine};
    use crate::application::storage::{FileWriter, PersistedSettings};
    use async_trait::async_trait;
    use soundlink_core::PlaybackStatus;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    // ── Test doubles ──────────────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingSink {
        sessions: Mutex<HashSet<String>>,
        sent: Mutex<Vec<(String, ServerEnvelope)>>,
        broadcasts: Mutex<Vec<ServerEnvelope>>,
    }

    impl RecordingSink {
        fn with_sessions(ids: &[&str]) -> Self {
            let sink = Self::default();
            sink.sessions
                .lock()
                .unwrap()
                .extend(ids.iter().map(|s| s.to_string()));
            sink
        }

        fn sent_to(&self, session: &str) -> Vec<ServerMsg> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == session)
                .map(|(_, m)| m.body.clone())
                .collect()
        }

        fn sent_envelopes(&self) -> Vec<(String, ServerEnvelope)> {
            self.sent.lock().unwrap().clone()
        }

        fn broadcast_bodies(&self) -> Vec<ServerMsg> {
            self.broadcasts
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.body.clone())
                .collect()
        }
    }

    impl MessageSink for RecordingSink {
        fn send_to(&self, session: &str, message: &ServerEnvelope) -> bool {
            if !self.sessions.lock().unwrap().contains(session) {
                return false;
            }
            self.sent
                .lock()
                .unwrap()
                .push((session.to_string(), message.clone()));
            true
        }

        fn broadcast(&self, message: &ServerEnvelope) -> usize {
            self.broadcasts.lock().unwrap().push(message.clone());
            self.sessions.lock().unwrap().len()
        }
    }

    #[derive(Default)]
    struct FakeStore {
        present: Mutex<HashSet<String>>,
        deleted: Mutex<Vec<String>>,
        fail_delete: bool,
    }

    impl FakeStore {
        fn with_files(names: &[&str]) -> Self {
            let store = Self::default();
            store
                .present
                .lock()
                .unwrap()
                .extend(names.iter().map(|s| s.to_string()));
            store
        }
    }

    #[async_trait]
    impl FileStore for FakeStore {
        fn path_for(&self, stored_name: &str) -> PathBuf {
            PathBuf::from("/store").join(stored_name)
        }

        async fn exists(&self, stored_name: &str) -> bool {
            self.present.lock().unwrap().contains(stored_name)
        }

        async fn create(&self, stored_name: &str) -> Result<FileWriter, FileStoreError> {
            self.present.lock().unwrap().insert(stored_name.to_string());
            Ok(Box::new(tokio::io::sink()))
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), FileStoreError> {
            let mut present = self.present.lock().unwrap();
            if !present.remove(from) {
                return Err(FileStoreError::NotFound(from.to_string()));
            }
            present.insert(to.to_string());
            Ok(())
        }

        async fn delete(&self, stored_name: &str) -> Result<(), FileStoreError> {
            if self.fail_delete {
                return Err(FileStoreError::Io {
                    path: self.path_for(stored_name),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            self.deleted.lock().unwrap().push(stored_name.to_string());
            if self.present.lock().unwrap().remove(stored_name) {
                Ok(())
            } else {
                Err(FileStoreError::NotFound(stored_name.to_string()))
            }
        }
    }

    #[derive(Default)]
    struct MemorySettings {
        current: Mutex<PersistedSettings>,
        saves: Mutex<Vec<SettingsPatch>>,
        save_threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl SettingsRepository for MemorySettings {
        fn load(&self) -> Result<PersistedSettings, SettingsError> {
            Ok(self.current.lock().unwrap().clone())
        }

        fn save(&self, patch: SettingsPatch) -> Result<(), SettingsError> {
            self.saves.lock().unwrap().push(patch.clone());
            self.save_threads
                .lock()
                .unwrap()
                .push(std::thread::current().id());
            patch.apply_to(&mut self.current.lock().unwrap());
            Ok(())
        }
    }

    fn file(id: &str, duration: Option<f64>) -> FileInfo {
        FileInfo {
            id: id.into(),
            name: format!("{id}.mp3"),
            size: 10,
            duration,
            added_at: 1,
        }
    }

    fn permissive_engine() -> MockPlaybackEngine {
        let mut engine = MockPlaybackEngine::new();
        engine.expect_play().returning(|_, _, _| Ok(1));
        engine.expect_pause().returning(|| Ok(()));
        engine.expect_stop().returning(|| Ok(()));
        engine.expect_seek().returning(|_| Ok(()));
        engine.expect_set_volume().returning(|_| Ok(()));
        engine.expect_set_loop().returning(|_| Ok(()));
        engine
    }

    /// Like [`permissive_engine`], but each `play` starts a new generation.
    fn counting_engine() -> MockPlaybackEngine {
        let mut engine = MockPlaybackEngine::new();
        let mut generation = 0;
        engine.expect_play().returning(move |_, _, _| {
            generation += 1;
            Ok(generation)
        });
        engine.expect_pause().returning(|| Ok(()));
        engine.expect_stop().returning(|| Ok(()));
        engine.expect_seek().returning(|_| Ok(()));
        engine.expect_set_volume().returning(|_| Ok(()));
        engine.expect_set_loop().returning(|_| Ok(()));
        engine
    }

    fn engine_event(generation: PlaybackGeneration, event: EngineEvent) -> ServerEvent {
        ServerEvent::Engine { generation, event }
    }

    struct Harness {
        dispatcher: Dispatcher,
        sink: Arc<RecordingSink>,
        store: Arc<FakeStore>,
        settings: Arc<MemorySettings>,
    }

    async fn harness_with(
        engine: MockPlaybackEngine,
        files: Vec<FileInfo>,
        store: FakeStore,
        sessions: &[&str],
    ) -> Harness {
        let sink = Arc::new(RecordingSink::with_sessions(sessions));
        let store = Arc::new(store);
        let settings = Arc::new(MemorySettings::default());
        settings.current.lock().unwrap().files = files;
        let dispatcher = Dispatcher::load(
            Arc::new(engine),
            store.clone(),
            settings.clone(),
            sink.clone(),
            1_000_000,
        )
        .await
        .expect("load");
        Harness {
            dispatcher,
            sink,
            store,
            settings,
        }
    }

    async fn harness(sessions: &[&str]) -> Harness {
        harness_with(
            permissive_engine(),
            vec![file("a", Some(2.0)), file("b", None)],
            FakeStore::with_files(&["a_a.mp3", "b_b.mp3"]),
            sessions,
        )
        .await
    }

    fn msg(session: &str, body: ControllerMsg) -> ServerEvent {
        ServerEvent::Session(SessionEvent::Message {
            session: session.to_string(),
            message: Envelope::with_id("req", body),
        })
    }

    fn last_broadcast_state(sink: &RecordingSink) -> PlaybackState {
        sink.broadcast_bodies()
            .into_iter()
            .rev()
            .find_map(|m| match m {
                ServerMsg::PlaybackState { state } => Some(state),
                _ => None,
            })
            .expect("a PLAYBACK_STATE broadcast")
    }

    // ── Connect / ping / list ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_sends_snapshot_to_new_session_only() {
        // Arrange
        let mut h = harness(&["s1", "s2"]).await;

        // Act
        h.dispatcher
            .handle_event(ServerEvent::Session(SessionEvent::Connected("s1".into())))
            .await;

        // Assert
        let kinds: Vec<_> = h.sink.sent_to("s1").iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["FILE_LIST", "PLAYBACK_STATE", "POWER_SAVING_STATE"]);
        assert!(h.sink.sent_to("s2").is_empty());
        assert!(h.sink.broadcast_bodies().is_empty());
    }

    #[tokio::test]
    async fn test_ping_replies_pong_with_same_id() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher.handle_event(msg("s1", ControllerMsg::Ping)).await;

        let sent = h.sink.sent_envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.id, "req");
        assert_eq!(sent[0].1.body, ServerMsg::Pong);
    }

    #[tokio::test]
    async fn test_get_file_list_replies_to_sender() {
        let mut h = harness(&["s1", "s2"]).await;

        h.dispatcher
            .handle_event(msg("s2", ControllerMsg::GetFileList))
            .await;

        match h.sink.sent_to("s2").as_slice() {
            [ServerMsg::FileList { files }] => assert_eq!(files.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.sink.broadcast_bodies().is_empty());
    }

    // ── Play ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_play_known_file_broadcasts_playing_state() {
        // Arrange
        let mut engine = MockPlaybackEngine::new();
        engine
            .expect_play()
            .withf(|path, volume, looping| {
                path.to_str() == Some("/store/a_a.mp3") && *volume == 0.8 && *looping
            })
            .times(1)
            .returning(|_, _, _| Ok(1));
        let mut h = harness_with(
            engine,
            vec![file("a", Some(2.0))],
            FakeStore::with_files(&["a_a.mp3"]),
            &["s1"],
        )
        .await;

        // Act
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        // Assert
        let state = last_broadcast_state(&h.sink);
        assert_eq!(state.status, PlaybackStatus::Playing);
        assert_eq!(state.current_file_id.as_deref(), Some("a"));
        assert_eq!(state.position_ms, 0);
        assert_eq!(state.duration_ms, 2_000);
        assert_eq!(h.dispatcher.catalog().last_played_file_id(), Some("a"));
        assert_eq!(
            h.settings.current.lock().unwrap().last_played_file_id.as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn test_play_unknown_file_errors_to_sender_only() {
        // Arrange
        let mut engine = MockPlaybackEngine::new();
        engine.expect_play().never();
        let mut h = harness_with(engine, vec![], FakeStore::default(), &["s1", "s2"]).await;
        let before = h.dispatcher.playback().clone();

        // Act
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "nope".into() }))
            .await;

        // Assert
        assert_eq!(h.dispatcher.playback(), &before);
        assert!(h.sink.broadcast_bodies().is_empty());
        assert!(h.sink.sent_to("s2").is_empty());
        match h.sink.sent_to("s1").as_slice() {
            [ServerMsg::Error { code, .. }] => assert_eq!(*code, ErrorCode::FileNotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_play_engine_failure_reverts_to_stopped_and_still_broadcasts() {
        let mut engine = MockPlaybackEngine::new();
        engine.expect_play().returning(|p, _, _| {
            Err(EngineError::Load {
                path: p.display().to_string(),
                reason: "corrupt".into(),
            })
        });
        let mut h = harness_with(
            engine,
            vec![file("a", None)],
            FakeStore::with_files(&["a_a.mp3"]),
            &["s1"],
        )
        .await;

        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        assert_eq!(last_broadcast_state(&h.sink).status, PlaybackStatus::Stopped);
    }

    // ── Pause / stop / volume / loop / seek ───────────────────────────────────

    #[tokio::test]
    async fn test_pause_after_play_broadcasts_paused() {
        let mut h = harness(&["s1"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        h.dispatcher.handle_event(msg("s1", ControllerMsg::Pause)).await;

        assert_eq!(last_broadcast_state(&h.sink).status, PlaybackStatus::Paused);
    }

    #[tokio::test]
    async fn test_stop_broadcasts_stopped_with_no_current_file() {
        let mut h = harness(&["s1", "s2", "s3"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        h.dispatcher.handle_event(msg("s1", ControllerMsg::Stop)).await;

        let state = last_broadcast_state(&h.sink);
        assert_eq!(state.status, PlaybackStatus::Stopped);
        assert_eq!(state.current_file_id, None);
    }

    #[tokio::test]
    async fn test_set_volume_is_clamped_before_engine_and_storage() {
        // Arrange
        let mut engine = MockPlaybackEngine::new();
        engine
            .expect_set_volume()
            .withf(|v| *v == 1.0)
            .times(1)
            .returning(|_| Ok(()));
        let mut h = harness_with(engine, vec![], FakeStore::default(), &["s1"]).await;

        // Act
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::SetVolume { volume: 1.5 }))
            .await;

        // Assert
        assert_eq!(last_broadcast_state(&h.sink).volume, 1.0);
        assert_eq!(h.settings.current.lock().unwrap().volume, 1.0);
    }

    #[tokio::test]
    async fn test_set_volume_negative_clamps_to_zero() {
        let mut h = harness(&["s1"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::SetVolume { volume: -3.0 }))
            .await;
        assert_eq!(last_broadcast_state(&h.sink).volume, 0.0);
    }

    #[tokio::test]
    async fn test_settings_are_saved_off_the_dispatcher_thread() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::SetVolume { volume: 0.5 }))
            .await;

        let threads = h.settings.save_threads.lock().unwrap().clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
        assert_eq!(h.settings.current.lock().unwrap().volume, 0.5);
    }

    #[tokio::test]
    async fn test_set_loop_persists_and_broadcasts() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::SetLoop { looping: false }))
            .await;

        assert!(!last_broadcast_state(&h.sink).looping);
        assert!(!h.settings.current.lock().unwrap().looping);
    }

    #[tokio::test]
    async fn test_seek_updates_position_without_broadcast() {
        let mut h = harness(&["s1"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;
        let broadcasts_before = h.sink.broadcast_bodies().len();

        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Seek { position_ms: 1_500 }))
            .await;

        assert_eq!(h.dispatcher.playback().position_ms, 1_500);
        assert_eq!(h.sink.broadcast_bodies().len(), broadcasts_before);
    }

    #[tokio::test]
    async fn test_pause_engine_failure_broadcasts_stopped() {
        // Arrange
        let mut engine = MockPlaybackEngine::new();
        engine.expect_play().returning(|_, _, _| Ok(1));
        engine
            .expect_pause()
            .times(1)
            .returning(|| Err(EngineError::Backend("device busy".into())));
        let mut h = harness_with(
            engine,
            vec![file("a", Some(2.0))],
            FakeStore::with_files(&["a_a.mp3"]),
            &["s1"],
        )
        .await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        // Act
        h.dispatcher.handle_event(msg("s1", ControllerMsg::Pause)).await;

        // Assert
        let state = last_broadcast_state(&h.sink);
        assert_eq!(state.status, PlaybackStatus::Stopped);
        assert_eq!(state.position_ms, 0);
    }

    #[tokio::test]
    async fn test_seek_engine_failure_broadcasts_stopped() {
        // Arrange
        let mut engine = MockPlaybackEngine::new();
        engine.expect_play().returning(|_, _, _| Ok(1));
        engine
            .expect_seek()
            .times(1)
            .returning(|_| Err(EngineError::NothingLoaded));
        let mut h = harness_with(
            engine,
            vec![file("a", Some(2.0))],
            FakeStore::with_files(&["a_a.mp3"]),
            &["s1"],
        )
        .await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;
        let broadcasts_before = h.sink.broadcast_bodies().len();

        // Act
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Seek { position_ms: 1_500 }))
            .await;

        // Assert
        assert_eq!(h.sink.broadcast_bodies().len(), broadcasts_before + 1);
        let state = last_broadcast_state(&h.sink);
        assert_eq!(state.status, PlaybackStatus::Stopped);
        assert_eq!(state.position_ms, 0);
    }

    // ── Delete ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_delete_current_file_stops_then_broadcasts_list() {
        // Arrange
        let mut h = harness(&["s1"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        // Act
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::DeleteFile { file_id: "a".into() }))
            .await;

        // Assert
        let bodies = h.sink.broadcast_bodies();
        let tail: Vec<_> = bodies.iter().rev().take(2).map(|m| m.kind()).collect();
        assert_eq!(tail, vec!["FILE_LIST", "PLAYBACK_STATE"]);
        assert_eq!(h.dispatcher.playback().status, PlaybackStatus::Stopped);
        assert!(!h.dispatcher.catalog().contains("a"));
        assert_eq!(h.dispatcher.catalog().last_played_file_id(), None);
        assert_eq!(h.store.deleted.lock().unwrap().as_slice(), ["a_a.mp3"]);
        assert_eq!(h.settings.current.lock().unwrap().files.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_other_file_keeps_playback() {
        let mut h = harness(&["s1"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::DeleteFile { file_id: "b".into() }))
            .await;

        assert_eq!(h.dispatcher.playback().status, PlaybackStatus::Playing);
        assert_eq!(h.sink.broadcast_bodies().last().unwrap().kind(), "FILE_LIST");
    }

    #[tokio::test]
    async fn test_delete_unknown_file_errors_to_sender() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::DeleteFile { file_id: "zzz".into() }))
            .await;

        assert!(matches!(
            h.sink.sent_to("s1").as_slice(),
            [ServerMsg::Error {
                code: ErrorCode::FileNotFound,
                ..
            }]
        ));
        assert!(h.sink.broadcast_bodies().is_empty());
    }

    #[tokio::test]
    async fn test_delete_store_failure_reports_internal_error_and_keeps_entry() {
        let store = FakeStore {
            fail_delete: true,
            ..FakeStore::with_files(&["a_a.mp3"])
        };
        let mut h = harness_with(permissive_engine(), vec![file("a", None)], store, &["s1"]).await;

        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::DeleteFile { file_id: "a".into() }))
            .await;

        assert!(h.dispatcher.catalog().contains("a"));
        assert!(matches!(
            h.sink.sent_to("s1").as_slice(),
            [ServerMsg::Error {
                code: ErrorCode::InternalError,
                ..
            }]
        ));
    }

    // ── Transfer ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_transfer_start_within_limit_is_accepted() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(msg(
                "s1",
                ControllerMsg::FileTransferStart {
                    file_id: "n".into(),
                    file_name: "n.mp3".into(),
                    file_size: 150_000,
                },
            ))
            .await;

        assert_eq!(
            h.sink.sent_to("s1"),
            vec![ServerMsg::FileTransferAck {
                file_id: "n".into(),
                accepted: true,
                reason: None
            }]
        );
    }

    #[tokio::test]
    async fn test_transfer_start_over_limit_is_refused_with_reason() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(msg(
                "s1",
                ControllerMsg::FileTransferStart {
                    file_id: "n".into(),
                    file_name: "n.mp3".into(),
                    file_size: 2_000_000,
                },
            ))
            .await;

        match h.sink.sent_to("s1").as_slice() {
            [ServerMsg::FileTransferAck {
                accepted, reason, ..
            }] => {
                assert!(!accepted);
                assert!(reason.as_deref().unwrap_or("").contains("exceeds"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transfer_success_adds_file_and_broadcasts_list_then_done() {
        // Arrange
        let mut h = harness(&["s1", "s2"]).await;

        // Act
        h.dispatcher
            .handle_event(ServerEvent::TransferFinished {
                header: TransferHeader::new("new", "new.mp3", 150_000),
                result: Ok(150_000),
            })
            .await;

        // Assert
        let kinds: Vec<_> = h.sink.broadcast_bodies().iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["FILE_LIST", "FILE_TRANSFER_DONE"]);
        assert_eq!(
            h.sink.broadcast_bodies()[1],
            ServerMsg::FileTransferDone {
                file_id: "new".into(),
                success: true
            }
        );
        assert_eq!(h.dispatcher.catalog().get("new").unwrap().size, 150_000);
        assert_eq!(h.settings.current.lock().unwrap().files.len(), 3);
    }

    #[tokio::test]
    async fn test_transfer_replacing_existing_id_keeps_single_entry() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(ServerEvent::TransferFinished {
                header: TransferHeader::new("a", "a.mp3", 99),
                result: Ok(99),
            })
            .await;

        assert_eq!(h.dispatcher.catalog().len(), 2);
        assert_eq!(h.dispatcher.catalog().get("a").unwrap().size, 99);
    }

    #[tokio::test]
    async fn test_transfer_replacing_under_new_name_removes_old_file() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(ServerEvent::TransferFinished {
                header: TransferHeader::new("a", "renamed.mp3", 99),
                result: Ok(99),
            })
            .await;

        assert_eq!(h.dispatcher.catalog().get("a").unwrap().name, "renamed.mp3");
        assert_eq!(h.store.deleted.lock().unwrap().as_slice(), ["a_a.mp3"]);
    }

    #[tokio::test]
    async fn test_transfer_replacing_under_same_name_keeps_file() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(ServerEvent::TransferFinished {
                header: TransferHeader::new("a", "a.mp3", 99),
                result: Ok(99),
            })
            .await;

        assert!(h.store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_failure_broadcasts_done_false_only() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(ServerEvent::TransferFinished {
                header: TransferHeader::new("x", "x.mp3", 10),
                result: Err("short".into()),
            })
            .await;

        assert_eq!(
            h.sink.broadcast_bodies(),
            vec![ServerMsg::FileTransferDone {
                file_id: "x".into(),
                success: false
            }]
        );
        assert!(!h.dispatcher.catalog().contains("x"));
    }

    // ── Import ────────────────────────────────────────────────────────────────

    fn scratch_source(name: &str, len: usize) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("soundlink-import-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, vec![3u8; len]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_import_adds_file_and_broadcasts_list() {
        // Arrange
        let mut h = harness(&["s1", "s2"]).await;
        let source = scratch_source("Night Rain.mp3", 1_234);

        // Act
        h.dispatcher
            .handle_event(ServerEvent::Import(source.clone()))
            .await;

        // Assert
        let imported = h
            .dispatcher
            .catalog()
            .files()
            .iter()
            .find(|f| f.name == "Night Rain.mp3")
            .cloned()
            .expect("imported entry");
        assert_eq!(imported.size, 1_234);
        assert!(h
            .store
            .present
            .lock()
            .unwrap()
            .contains(&stored_file_name(&imported.id, "Night Rain.mp3")));
        match h.sink.broadcast_bodies().as_slice() {
            [ServerMsg::FileList { files }] => assert_eq!(files.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.settings.current.lock().unwrap().files.len(), 3);
        let _ = std::fs::remove_dir_all(source.parent().unwrap());
    }

    #[tokio::test]
    async fn test_import_missing_source_changes_nothing() {
        let mut h = harness(&["s1"]).await;

        let result = h
            .dispatcher
            .import_file(Path::new("/definitely/not/here.mp3"))
            .await;

        assert!(matches!(result, Err(ImportError::Source { .. })));
        assert_eq!(h.dispatcher.catalog().len(), 2);
        assert!(h.sink.broadcast_bodies().is_empty());
        assert_eq!(h.store.present.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_import_directory_is_refused() {
        let mut h = harness(&["s1"]).await;
        let dir = std::env::temp_dir();

        let result = h.dispatcher.import_file(&dir).await;

        assert!(matches!(result, Err(ImportError::NotAFile(_))));
        assert!(h.sink.broadcast_bodies().is_empty());
    }

    // ── Power saving ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_power_saving_is_broadcast() {
        let mut h = harness(&["s1", "s2"]).await;

        h.dispatcher
            .handle_event(msg("s2", ControllerMsg::SetPowerSaving { enabled: true }))
            .await;

        assert!(h.dispatcher.power_saving());
        assert_eq!(
            h.sink.broadcast_bodies(),
            vec![ServerMsg::PowerSavingState { enabled: true }]
        );
    }

    // ── Engine events ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_finished_without_loop_stops_and_keeps_file() {
        let mut h = harness(&["s1"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::SetLoop { looping: false }))
            .await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        h.dispatcher
            .handle_event(ServerEvent::Engine {
                generation: 1,
                event: EngineEvent::Finished,
            })
            .await;

        let state = last_broadcast_state(&h.sink);
        assert_eq!(state.status, PlaybackStatus::Stopped);
        assert_eq!(state.position_ms, 0);
        assert_eq!(state.current_file_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_position_event_is_broadcast_only_while_playing() {
        let mut h = harness(&["s1"]).await;

        h.dispatcher
            .handle_event(ServerEvent::Engine {
                generation: 1,
                event: EngineEvent::Position {
                    position_ms: 100,
                    duration_ms: 0,
                },
            })
            .await;
        assert!(h.sink.broadcast_bodies().is_empty());

        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "b".into() }))
            .await;
        h.dispatcher
            .handle_event(ServerEvent::Engine {
                generation: 1,
                event: EngineEvent::Position {
                    position_ms: 4_000,
                    duration_ms: 60_000,
                },
            })
            .await;

        let state = last_broadcast_state(&h.sink);
        assert_eq!(state.position_ms, 4_000);
        assert_eq!(state.duration_ms, 60_000);
    }

    #[tokio::test]
    async fn test_finished_from_previous_file_does_not_stop_next_file() {
        // Arrange: a's end is still queued when b starts
        let mut h = harness_with(
            counting_engine(),
            vec![file("a", Some(2.0)), file("b", None)],
            FakeStore::with_files(&["a_a.mp3", "b_b.mp3"]),
            &["s1"],
        )
        .await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::SetLoop { looping: false }))
            .await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "b".into() }))
            .await;

        // Act
        h.dispatcher
            .handle_event(engine_event(1, EngineEvent::Finished))
            .await;
        h.dispatcher
            .handle_event(engine_event(
                2,
                EngineEvent::Position {
                    position_ms: 2_000,
                    duration_ms: 30_000,
                },
            ))
            .await;

        // Assert
        let state = h.dispatcher.playback();
        assert_eq!(state.status, PlaybackStatus::Playing);
        assert_eq!(state.current_file_id.as_deref(), Some("b"));
        assert_eq!(state.position_ms, 2_000);
        assert_eq!(last_broadcast_state(&h.sink).position_ms, 2_000);
    }

    #[tokio::test]
    async fn test_finished_queued_behind_pause_is_ignored() {
        let mut h = harness(&["s1"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::SetLoop { looping: false }))
            .await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;
        h.dispatcher.handle_event(msg("s1", ControllerMsg::Pause)).await;
        let broadcasts_before = h.sink.broadcast_bodies().len();

        h.dispatcher
            .handle_event(engine_event(1, EngineEvent::Finished))
            .await;

        assert_eq!(h.dispatcher.playback().status, PlaybackStatus::Paused);
        assert_eq!(h.sink.broadcast_bodies().len(), broadcasts_before);
    }

    #[tokio::test]
    async fn test_engine_failure_event_reverts_to_stopped() {
        let mut h = harness(&["s1"]).await;
        h.dispatcher
            .handle_event(msg("s1", ControllerMsg::Play { file_id: "a".into() }))
            .await;

        h.dispatcher
            .handle_event(ServerEvent::Engine {
                generation: 1,
                event: EngineEvent::Failed("device lost".into()),
            })
            .await;

        assert_eq!(last_broadcast_state(&h.sink).status, PlaybackStatus::Stopped);
    }

    // ── Startup ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_load_prunes_files_missing_from_store() {
        // Arrange: settings list a and b, but only a is on disk; b was last played
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(FakeStore::with_files(&["a_a.mp3"]));
        let settings = Arc::new(MemorySettings::default());
        {
            let mut current = settings.current.lock().unwrap();
            current.files = vec![file("a", None), file("b", None)];
            current.last_played_file_id = Some("b".into());
            current.volume = 0.4;
            current.looping = false;
        }

        // Act
        let d = Dispatcher::load(
            Arc::new(permissive_engine()),
            store,
            settings.clone(),
            sink,
            10,
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(d.catalog().len(), 1);
        assert_eq!(d.catalog().last_played_file_id(), None);
        assert_eq!(d.playback().volume, 0.4);
        assert!(!d.playback().looping);
        let saved = settings.current.lock().unwrap();
        assert_eq!(saved.files.len(), 1);
        assert_eq!(saved.last_played_file_id, None);
    }

    #[tokio::test]
    async fn test_run_exits_when_channel_closes() {
        let h = harness(&["s1"]).await;
        let (tx, rx) = mpsc::channel(4);
        tx.send(msg("s1", ControllerMsg::Ping)).await.unwrap();
        drop(tx);

        h.dispatcher.run(rx).await;

        assert_eq!(h.sink.sent_to("s1"), vec![ServerMsg::Pong]);
    }
}
