//! # soundlink-core
//!
//! Shared library for SoundLink containing the wire protocol, the frame
//! codec, and the playback domain types.
//!
//! This crate is used by both the server and controller applications.
//! It has zero dependencies on OS APIs, async runtimes, or network sockets.
//!
//! # Architecture overview (for beginners)
//!
//! SoundLink lets one device (the "server") own a library of audio files and a
//! playback engine, while other devices on the same LAN (the "controllers")
//! find it and drive playback remotely.
//!
//! This crate (`soundlink-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the network.  Every message is a
//!   JSON object wrapped in a 4-byte big-endian length prefix, and the set of
//!   messages each side may send is a closed Rust enum.
//!
//! - **`domain`** – Pure state with no I/O: the file catalog, the playback
//!   state machine, the file-transfer header, and discovery records.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `soundlink_core::PlaybackState` instead of the full module path.
pub use domain::catalog::{FileCatalog, FileInfo};
pub use domain::discovery::DiscoveredDevice;
pub use domain::playback::{PlaybackState, PlaybackStatus};
pub use domain::transfer::{TransferHeader, TransferSession};
pub use protocol::codec::{decode_frame, encode_frame, FrameDecoder, FrameError};
pub use protocol::messages::{ControllerMsg, Envelope, ErrorCode, ServerMsg};
