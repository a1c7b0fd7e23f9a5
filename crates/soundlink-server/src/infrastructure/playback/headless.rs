//! Headless playback engine.
//!
//! [`HeadlessEngine`] behaves like a real player from the dispatcher's point
//! of view:
//!
//! - `play` fails with [`EngineError::Load`] when the file is missing.
//! - While playing, a ticker task advances the position and reports
//!   [`EngineEvent::Position`] every `tick`.
//! - With a known track length the file ends: it restarts when looping,
//!   otherwise [`EngineEvent::Finished`] is reported and the ticker stops.
//! - Every `play`, `pause` and `stop` starts a new generation.  A ticker that
//!   belongs to an older generation exits without touching the state.
//!
//! No audio is produced.  This is the engine the server binary runs with on
//! machines without an output device, and the one the integration tests
//! drive end to end.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::application::dispatch::ServerEvent;
use crate::application::engine::{EngineError, EngineEvent, PlaybackEngine, PlaybackGeneration};

/// Default interval between position reports.
pub const DEFAULT_TICK: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct EngineInner {
    loaded: Option<PathBuf>,
    position_ms: u64,
    volume: f64,
    looping: bool,
    generation: PlaybackGeneration,
    ticker: Option<JoinHandle<()>>,
}

impl EngineInner {
    /// Stops the ticker and moves to the next generation.
    fn halt_ticker(&mut self) {
        self.generation += 1;
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// A [`PlaybackEngine`] that keeps time without producing sound.
pub struct HeadlessEngine {
    events: mpsc::Sender<ServerEvent>,
    tick: Duration,
    track_length: Option<Duration>,
    inner: Arc<Mutex<EngineInner>>,
}

impl HeadlessEngine {
    /// Creates an engine that reports on `events` every [`DEFAULT_TICK`] and
    /// treats every file as endless.
    pub fn new(events: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            events,
            tick: DEFAULT_TICK,
            track_length: None,
            inner: Arc::new(Mutex::new(EngineInner::default())),
        }
    }

    /// Sets the interval between position reports.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Gives every file the same length so playback can end.
    pub fn with_track_length(mut self, length: Duration) -> Self {
        self.track_length = Some(length);
        self
    }

    /// Current position in milliseconds.
    pub fn position_ms(&self) -> u64 {
        self.lock().position_ms
    }

    /// The loaded file, if any.
    pub fn loaded(&self) -> Option<PathBuf> {
        self.lock().loaded.clone()
    }

    /// Last volume applied.
    pub fn volume(&self) -> f64 {
        self.lock().volume
    }

    /// Returns `true` while the ticker is running.
    pub fn is_running(&self) -> bool {
        self.lock().ticker.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generation of the most recent `play`, `pause` or `stop`.
    pub fn generation(&self) -> PlaybackGeneration {
        self.lock().generation
    }

    fn spawn_ticker(&self, generation: PlaybackGeneration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let tick = self.tick;
        let tick_ms = tick.as_millis() as u64;
        let length_ms = self.track_length.map(|l| l.as_millis() as u64);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;

                let event = {
                    let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
                    if state.generation != generation {
                        return;
                    }
                    state.position_ms = state.position_ms.saturating_add(tick_ms);
                    match length_ms {
                        Some(len) if state.position_ms >= len => {
                            if state.looping {
                                state.position_ms = 0;
                                EngineEvent::Position {
                                    position_ms: 0,
                                    duration_ms: len,
                                }
                            } else {
                                state.position_ms = 0;
                                state.ticker = None;
                                EngineEvent::Finished
                            }
                        }
                        _ => EngineEvent::Position {
                            position_ms: state.position_ms,
                            duration_ms: length_ms.unwrap_or(0),
                        },
                    }
                };

                let finished = event == EngineEvent::Finished;
                let sent = events
                    .send(ServerEvent::Engine { generation, event })
                    .await;
                if sent.is_err() || finished {
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl PlaybackEngine for HeadlessEngine {
    async fn play(
        &self,
        path: &Path,
        volume: f64,
        looping: bool,
    ) -> Result<PlaybackGeneration, EngineError> {
        let present = tokio::fs::try_exists(path).await.unwrap_or(false);
        if !present {
            return Err(EngineError::Load {
                path: path.display().to_string(),
                reason: "file does not exist".to_string(),
            });
        }

        let mut state = self.lock();
        state.halt_ticker();
        let generation = state.generation;
        state.loaded = Some(path.to_path_buf());
        state.position_ms = 0;
        state.volume = volume;
        state.looping = looping;
        state.ticker = Some(self.spawn_ticker(generation));
        info!("headless playback of {} (generation {generation})", path.display());
        Ok(generation)
    }

    async fn pause(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.loaded.is_none() {
            return Err(EngineError::NothingLoaded);
        }
        state.halt_ticker();
        debug!("paused at {} ms", state.position_ms);
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.halt_ticker();
        state.loaded = None;
        state.position_ms = 0;
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.loaded.is_none() {
            return Err(EngineError::NothingLoaded);
        }
        state.position_ms = match self.track_length {
            Some(len) => position_ms.min(len.as_millis() as u64),
            None => position_ms,
        };
        Ok(())
    }

    async fn set_volume(&self, volume: f64) -> Result<(), EngineError> {
        self.lock().volume = volume;
        Ok(())
    }

    async fn set_loop(&self, looping: bool) -> Result<(), EngineError> {
        self.lock().looping = looping;
        Ok(())
    }
}

impl Drop for HeadlessEngine {
    fn drop(&mut self) {
        self.lock().halt_ticker();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
