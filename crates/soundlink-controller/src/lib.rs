//! SoundLink controller library.
//!
//! # Layers
//!
//! - **`application`** – the controller-side mirror of the server's state,
//!   updated from every event the connection delivers.
//! - **`infrastructure`** – the control connection ([`ControllerClient`]),
//!   the upload sender, and the LAN discovery browser.
//!
//! The `soundlink-controller` binary is a thin CLI over these pieces.
//!
//! [`ControllerClient`]: infrastructure::network::ControllerClient

pub mod application;
pub mod infrastructure;
