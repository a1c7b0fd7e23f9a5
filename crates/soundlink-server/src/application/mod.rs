//! Application layer for the server.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure state and rules in `soundlink-core`) and the infrastructure (sockets,
//! files, the audio device).  Code here:
//!
//! - **Orchestrates** domain objects to fulfil a request (e.g., "a controller
//!   asked to play file X: update the state, start the engine, tell everyone").
//! - **Depends on abstractions** (traits) rather than concrete adapters, so the
//!   real engine or file store can be swapped for a test double.
//!
//! # Sub-modules
//!
//! - **`dispatch`** – The single task that owns the authoritative playback
//!   state and catalog.  Every session message, engine event, and finished
//!   upload funnels through it, one at a time.
//! - **`engine`** – The [`engine::PlaybackEngine`] seam and the events an
//!   engine reports back.
//! - **`storage`** – The [`storage::FileStore`] and
//!   [`storage::SettingsRepository`] seams.

pub mod dispatch;
pub mod engine;
pub mod storage;
