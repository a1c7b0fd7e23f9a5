//! Playback engine implementations.
//!
//! Only a headless engine ships today: it validates the file, tracks the
//! position on a timer, and reports progress exactly like an audio backend
//! would, without opening an output device.  A decoding backend plugs in by
//! implementing [`crate::application::engine::PlaybackEngine`] next to it.

pub mod headless;
