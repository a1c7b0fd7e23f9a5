//! The authoritative playback state and its transitions.
//!
//! # State machine
//!
//! ```text
//!              PLAY(file)                PAUSE
//!   stopped ──────────────▶ playing ──────────────▶ paused
//!      ▲                     │  ▲                    │
//!      │        STOP / end   │  └──── PLAY(file) ────┘
//!      └─────────────────────┘
//! ```
//!
//! - `PLAY` from any state loads the file and starts at position 0.  It is the
//!   only way out of `paused`; there is no separate resume command.
//! - `PAUSE` only acts while `playing`.
//! - `STOP` from any state unloads the file.
//! - When the engine reports the end of a non-looping file the state drops
//!   to `stopped` at position 0 but keeps `current_file_id`, so controllers
//!   can still show what was last played.
//!
//! Volume and loop changes never alter `status`.

use serde::{Deserialize, Serialize};

use crate::domain::catalog::FileInfo;

/// Volume applied to a fresh install.
pub const DEFAULT_VOLUME: f64 = 0.8;

/// Playback status as shown to controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Full playback snapshot broadcast in every `PLAYBACK_STATE` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    /// File currently loaded, if any.
    pub current_file_id: Option<String>,
    pub position_ms: u64,
    pub duration_ms: u64,
    /// Output volume in `[0.0, 1.0]`.
    pub volume: f64,
    /// Whether the current file restarts when it ends.
    #[serde(rename = "loop")]
    pub looping: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Stopped,
            current_file_id: None,
            position_ms: 0,
            duration_ms: 0,
            volume: DEFAULT_VOLUME,
            looping: true,
        }
    }
}

/// Clamps a requested volume into `[0.0, 1.0]`.  NaN maps to 0.
pub fn clamp_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

impl PlaybackState {
    /// Builds the startup state from persisted volume and loop settings.
    pub fn with_settings(volume: f64, looping: bool) -> Self {
        Self {
            volume: clamp_volume(volume),
            looping,
            ..Self::default()
        }
    }

    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }

    /// Loads `file` and starts it from the beginning.
    pub fn play(&mut self, file: &FileInfo) {
        self.status = PlaybackStatus::Playing;
        self.current_file_id = Some(file.id.clone());
        self.position_ms = 0;
        self.duration_ms = file.duration_ms();
    }

    /// Pauses playback.  Returns `false` (and changes nothing) unless the
    /// state was `playing`.
    pub fn pause(&mut self) -> bool {
        if self.status != PlaybackStatus::Playing {
            return false;
        }
        self.status = PlaybackStatus::Paused;
        true
    }

    /// Stops playback and unloads the current file.
    pub fn stop(&mut self) {
        self.status = PlaybackStatus::Stopped;
        self.current_file_id = None;
        self.position_ms = 0;
    }

    /// Stores the clamped volume and returns it.
    pub fn set_volume(&mut self, volume: f64) -> f64 {
        self.volume = clamp_volume(volume);
        self.volume
    }

    pub fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Moves the position, capped at the known duration.
    pub fn seek(&mut self, position_ms: u64) {
        self.position_ms = if self.duration_ms > 0 {
            position_ms.min(self.duration_ms)
        } else {
            position_ms
        };
    }

    /// Applies a periodic position report from the engine.
    ///
    /// A zero `duration_ms` means the engine does not know the duration yet
    /// and leaves the stored value untouched.
    pub fn apply_position(&mut self, position_ms: u64, duration_ms: u64) {
        self.position_ms = position_ms;
        if duration_ms > 0 {
            self.duration_ms = duration_ms;
        }
    }

    /// Handles the engine reaching the end of the current file.
    ///
    /// Returns `true` if the state changed.  A looping file wraps to position
    /// 0 and keeps playing.
    pub fn finish(&mut self) -> bool {
        if self.current_file_id.is_none() || self.status == PlaybackStatus::Stopped {
            return false;
        }
        if self.looping {
            self.position_ms = 0;
        } else {
            self.status = PlaybackStatus::Stopped;
            self.position_ms = 0;
        }
        true
    }

    /// Handles an engine failure: playback reverts to `stopped`.
    pub fn fail(&mut self) {
        self.status = PlaybackStatus::Stopped;
        self.position_ms = 0;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
