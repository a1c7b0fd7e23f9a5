//! The playback engine seam.
//!
//! Decoding and audio output live behind [`PlaybackEngine`].  The dispatcher
//! calls it for every playback command and the engine reports progress back
//! as [`EngineEvent`]s on the dispatcher's event channel.
//!
//! The engine owns looping: when `set_loop(true)` is in effect it restarts
//! the file itself and only reports [`EngineEvent::Finished`] for a file that
//! really ended.
//!
//! # Generations
//!
//! Events travel through the same queue as controller commands, so an event
//! can still be waiting in the queue after the playback that produced it was
//! replaced.  Every successful `play` therefore returns a fresh
//! [`PlaybackGeneration`], and the engine reports each event together with
//! the generation it belongs to.  The dispatcher ignores events whose
//! generation is not the one currently playing.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Error type for playback engine operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The file could not be opened or decoded.
    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },

    /// The command needs a loaded file but none is loaded.
    #[error("no file loaded")]
    NothingLoaded,

    /// The output device or decoder reported a failure.
    #[error("engine failure: {0}")]
    Backend(String),
}

/// Identifies one successful [`PlaybackEngine::play`] call.
pub type PlaybackGeneration = u64;

/// Progress reported by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Periodic position report while playing.  `duration_ms` is 0 when the
    /// engine does not know the length yet.
    Position { position_ms: u64, duration_ms: u64 },

    /// The current (non-looping) file played to its end.
    Finished,

    /// Playback stopped because of an error.
    Failed(String),
}

/// Audio playback backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    /// Loads the file at `path` and starts it from the beginning.
    ///
    /// Returns the generation that this playback's events will carry.
    async fn play(
        &self,
        path: &Path,
        volume: f64,
        looping: bool,
    ) -> Result<PlaybackGeneration, EngineError>;

    /// Pauses the loaded file.
    async fn pause(&self) -> Result<(), EngineError>;

    /// Stops and unloads the current file.
    async fn stop(&self) -> Result<(), EngineError>;

    /// Moves the playback position of the loaded file.
    async fn seek(&self, position_ms: u64) -> Result<(), EngineError>;

    /// Sets the output volume (already clamped to `[0.0, 1.0]`).
    async fn set_volume(&self, volume: f64) -> Result<(), EngineError>;

    /// Enables or disables looping of the loaded file.
    async fn set_loop(&self, looping: bool) -> Result<(), EngineError>;
}
