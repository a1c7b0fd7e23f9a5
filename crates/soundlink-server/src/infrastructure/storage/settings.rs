//! [`SettingsRepository`] implementations.
//!
//! [`TomlSettingsRepository`] keeps the settings in `settings.toml` next to
//! the server configuration:
//!
//! ```toml
//! volume = 0.65
//! loop = true
//! lastPlayedFileId = "9f0c..."
//!
//! [[files]]
//! id = "9f0c..."
//! name = "rain.mp3"
//! size = 48213
//! addedAt = 1718000000000
//! ```
//!
//! Every `save` is a read-merge-write of the whole file under a mutex, so a
//! patch never loses fields written by an earlier one.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use soundlink_core::domain::playback::DEFAULT_VOLUME;
use soundlink_core::FileInfo;
use tracing::debug;

use crate::application::storage::{
    PersistedSettings, SettingsError, SettingsPatch, SettingsRepository,
};

/// File name of the settings file inside the config directory.
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// On-disk shape of [`PersistedSettings`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default = "default_volume")]
    volume: f64,
    #[serde(default = "default_true", rename = "loop")]
    looping: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_played_file_id: Option<String>,
    // Arrays of tables go last in TOML.
    #[serde(default)]
    files: Vec<FileInfo>,
}

fn default_volume() -> f64 {
    DEFAULT_VOLUME
}
fn default_true() -> bool {
    true
}

impl From<SettingsFile> for PersistedSettings {
    fn from(file: SettingsFile) -> Self {
        Self {
            files: file.files,
            last_played_file_id: file.last_played_file_id,
            volume: file.volume,
            looping: file.looping,
        }
    }
}

impl From<PersistedSettings> for SettingsFile {
    fn from(settings: PersistedSettings) -> Self {
        Self {
            volume: settings.volume,
            looping: settings.looping,
            last_played_file_id: settings.last_played_file_id,
            files: settings.files,
        }
    }
}

// ── TOML file ─────────────────────────────────────────────────────────────────

/// Settings stored in a TOML file.
pub struct TomlSettingsRepository {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TomlSettingsRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Repository for `settings.toml` inside `config_dir`.
    pub fn in_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join(SETTINGS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<PersistedSettings, SettingsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let file: SettingsFile = toml::from_str(&content)?;
                Ok(file.into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(PersistedSettings::default())
            }
            Err(source) => Err(SettingsError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, settings: PersistedSettings) -> Result<(), SettingsError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| SettingsError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(&SettingsFile::from(settings))?;
        std::fs::write(&self.path, content).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl SettingsRepository for TomlSettingsRepository {
    fn load(&self) -> Result<PersistedSettings, SettingsError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
    }

    fn save(&self, patch: SettingsPatch) -> Result<(), SettingsError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut settings = self.read()?;
        patch.apply_to(&mut settings);
        self.write(settings)?;
        debug!("settings saved to {}", self.path.display());
        Ok(())
    }
}

// ── In memory ─────────────────────────────────────────────────────────────────

/// Settings that live only as long as the process.
#[derive(Default)]
pub struct InMemorySettingsRepository {
    settings: Mutex<PersistedSettings>,
}

impl InMemorySettingsRepository {
    pub fn new(initial: PersistedSettings) -> Self {
        Self {
            settings: Mutex::new(initial),
        }
    }
}

impl SettingsRepository for InMemorySettingsRepository {
    fn load(&self) -> Result<PersistedSettings, SettingsError> {
        Ok(self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, patch: SettingsPatch) -> Result<(), SettingsError> {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        patch.apply_to(&mut settings);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
