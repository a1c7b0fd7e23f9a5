//! Domain entities for SoundLink.
//!
//! This module contains pure state and rules with no infrastructure
//! dependencies: no sockets, no file system, no async runtime.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! The **domain** layer is the innermost ring of the design.  It holds the
//! data types and the rules that make SoundLink what it is (a catalog of audio
//! files, a playback state machine, the shape of an upload) and nothing else.
//! The server and controller crates wrap these types with networking and
//! storage, but the domain never depends on them, so every rule here can be
//! unit-tested without any setup.

/// The server-owned list of stored audio files.
pub mod catalog;

/// Records produced by LAN service discovery.
pub mod discovery;

/// The authoritative playback state and its transitions.
pub mod playback;

/// The bulk file-transfer header and per-connection bookkeeping.
pub mod transfer;
