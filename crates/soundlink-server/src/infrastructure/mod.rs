//! Infrastructure layer for the server application.
//!
//! Contains OS-facing adapters: TCP listeners for the control and transfer
//! channels, the UDP discovery responder, file-system storage, and the
//! playback engine implementation.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `soundlink_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod playback;
pub mod storage;
