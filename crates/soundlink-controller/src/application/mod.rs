//! Application layer for the controller.
//!
//! Holds what the controller knows about the server.  Nothing here touches
//! sockets: the connection reports [`events::ClientEvent`]s and they are
//! folded into a [`mirror::ServerMirror`].

pub mod events;
pub mod mirror;
