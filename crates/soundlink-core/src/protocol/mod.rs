//! Protocol module containing message types, the frame codec, and the
//! message id/timestamp helpers.

pub mod codec;
pub mod ids;
pub mod messages;

pub use codec::{decode_frame, encode_frame, FrameDecoder, FrameError, MAX_FRAME_LEN};
pub use ids::{new_message_id, now_millis};
pub use messages::*;

/// TCP port of the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 9876;

/// TCP port of the bulk file-transfer channel.
pub const DEFAULT_TRANSFER_PORT: u16 = 9877;

/// UDP port used by LAN discovery probes and announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9878;
