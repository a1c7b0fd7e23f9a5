//! Storage seams used by the dispatcher and the transfer receiver.
//!
//! - [`FileStore`] holds the audio files themselves.  Uploads and local
//!   imports are written under a [`partial_name`] first and renamed into
//!   place once complete.
//! - [`SettingsRepository`] holds the small amount of state that survives a
//!   restart: the catalog, the last played file, volume and loop.
//!
//! Runtime state (status, position, power saving, connected sessions) is
//! never persisted.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use soundlink_core::domain::playback::DEFAULT_VOLUME;
use soundlink_core::FileInfo;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

// ── File store ────────────────────────────────────────────────────────────────

/// Error type for file store operations.
#[derive(Debug, Error)]
pub enum FileStoreError {
    /// The named file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// A file-system I/O error occurred.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A writable handle returned by [`FileStore::create`].
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where uploaded audio files live.
///
/// Files are addressed by their stored name
/// (see [`soundlink_core::domain::transfer::stored_file_name`]).
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Absolute path the engine should open for `stored_name`.
    fn path_for(&self, stored_name: &str) -> PathBuf;

    /// Returns `true` if `stored_name` exists.
    async fn exists(&self, stored_name: &str) -> bool;

    /// Creates (or truncates) `stored_name` and returns a streaming writer.
    async fn create(&self, stored_name: &str) -> Result<FileWriter, FileStoreError>;

    /// Moves `from` to `to`, replacing any file already stored as `to`.
    ///
    /// # Errors
    ///
    /// Returns [`FileStoreError::NotFound`] if `from` does not exist.
    async fn rename(&self, from: &str, to: &str) -> Result<(), FileStoreError>;

    /// Deletes `stored_name`.
    ///
    /// # Errors
    ///
    /// Returns [`FileStoreError::NotFound`] if it does not exist.
    async fn delete(&self, stored_name: &str) -> Result<(), FileStoreError>;
}

/// Name a file is written under until it is complete.
pub fn partial_name(stored_name: &str) -> String {
    format!("{stored_name}.partial")
}

/// Error type for importing a local file into the store.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The source could not be opened or read.
    #[error("cannot read {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source is a directory or has no usable file name.
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),

    /// Copying into the store failed part way.
    #[error("copy failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Store(#[from] FileStoreError),
}

/// Copies the file at `source` into `store` as `stored_name` and returns the
/// number of bytes copied.
///
/// An existing `stored_name` is only replaced once the copy is complete.
pub async fn copy_into_store(
    store: &dyn FileStore,
    source: &Path,
    stored_name: &str,
) -> Result<u64, ImportError> {
    let unreadable = |e: std::io::Error| ImportError::Source {
        path: source.to_path_buf(),
        source: e,
    };
    let metadata = tokio::fs::metadata(source).await.map_err(unreadable)?;
    if !metadata.is_file() {
        return Err(ImportError::NotAFile(source.to_path_buf()));
    }
    let mut file = tokio::fs::File::open(source).await.map_err(unreadable)?;

    let partial = partial_name(stored_name);
    let mut writer = store.create(&partial).await?;
    let copied: Result<u64, std::io::Error> = async {
        let n = tokio::io::copy(&mut file, &mut writer).await?;
        writer.shutdown().await?;
        Ok(n)
    }
    .await;
    drop(writer);

    let result = match copied {
        Ok(n) => store
            .rename(&partial, stored_name)
            .await
            .map(|()| n)
            .map_err(ImportError::from),
        Err(e) => Err(e.into()),
    };
    if result.is_err() {
        match store.delete(&partial).await {
            Ok(()) | Err(FileStoreError::NotFound(_)) => {}
            Err(e) => warn!("could not remove partial copy {partial}: {e}"),
        }
    }
    result
}

// ── Settings repository ───────────────────────────────────────────────────────

/// Error type for settings persistence.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error accessing settings at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Everything the server remembers across restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSettings {
    pub files: Vec<FileInfo>,
    pub last_played_file_id: Option<String>,
    pub volume: f64,
    pub looping: bool,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            last_played_file_id: None,
            volume: DEFAULT_VOLUME,
            looping: true,
        }
    }
}

/// A partial update.  `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub files: Option<Vec<FileInfo>>,
    /// `Some(None)` clears the last played file.
    pub last_played_file_id: Option<Option<String>>,
    pub volume: Option<f64>,
    pub looping: Option<bool>,
}

impl SettingsPatch {
    /// Applies the patch to `settings`.
    pub fn apply_to(self, settings: &mut PersistedSettings) {
        if let Some(files) = self.files {
            settings.files = files;
        }
        if let Some(last) = self.last_played_file_id {
            settings.last_played_file_id = last;
        }
        if let Some(volume) = self.volume {
            settings.volume = volume;
        }
        if let Some(looping) = self.looping {
            settings.looping = looping;
        }
    }
}

/// Persistent key/value settings.
pub trait SettingsRepository: Send + Sync {
    /// Loads the stored settings, or defaults when nothing was saved yet.
    fn load(&self) -> Result<PersistedSettings, SettingsError>;

    /// Merges `patch` into the stored settings.
    fn save(&self, patch: SettingsPatch) -> Result<(), SettingsError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
