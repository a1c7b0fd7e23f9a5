//! Network infrastructure for the server application.
//!
//! # Sub-modules
//!
//! - **`control_server`** – Accepts controller connections on the control
//!   port, runs one reader and one writer task per session, and implements
//!   [`crate::application::dispatch::MessageSink`] for targeted sends and
//!   broadcasts.
//!
//! - **`transfer_server`** – Accepts upload connections on the transfer port
//!   and streams each file into the [`crate::application::storage::FileStore`].
//!
//! - **`discovery`** – Answers LAN discovery probes so controllers can find
//!   this server without typing an IP address.

use std::net::SocketAddr;

use thiserror::Error;

pub mod control_server;
pub mod discovery;
pub mod transfer_server;

/// Error type for listener setup.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
