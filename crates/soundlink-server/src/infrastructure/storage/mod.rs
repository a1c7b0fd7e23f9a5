//! Storage infrastructure: configuration, persisted settings, and the audio
//! file store.
//!
//! - **`config`** – the server's TOML configuration file (ports, device name,
//!   storage directory).  Read once at startup.
//! - **`settings`** – [`crate::application::storage::SettingsRepository`]
//!   implementations: a TOML file next to the configuration, and an
//!   in-memory variant used by tests and when no config directory exists.
//! - **`file_store`** – [`crate::application::storage::FileStore`] on top of
//!   a local directory.

pub mod config;
pub mod file_store;
pub mod settings;
