//! All SoundLink control-channel message types.
//!
//! # JSON discriminant
//!
//! Every message is a JSON object with a `"type"` field that identifies the
//! variant, plus the common `"id"` and `"timestamp"` fields.  All other fields
//! are flattened into the same object and use camelCase names:
//!
//! ```json
//! {"id":"5f0c…","timestamp":1700000000000,"type":"PLAY","fileId":"a1"}
//! ```
//!
//! The common fields live on [`Envelope`]; the variant-specific part is one of
//! two closed enums:
//!
//! - [`ControllerMsg`] – everything a controller may send to the server.
//! - [`ServerMsg`] – everything the server may send to a controller.
//!
//! # Why separate controller→server and server→controller types?
//!
//! Using two distinct enums makes it a compile-time error to send a
//! server-only message from a controller, and vice versa.  A server that
//! receives `{"type":"PONG"}` on its control port fails to decode it as a
//! `ControllerMsg`, which the codec reports as a malformed payload.

use serde::{Deserialize, Serialize};

use crate::domain::catalog::FileInfo;
use crate::domain::playback::PlaybackState;
use crate::protocol::ids::{new_message_id, now_millis};

// ── Common envelope ───────────────────────────────────────────────────────────

/// The fields every message carries, wrapped around a direction-specific body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Sender-chosen identifier.  Only `PONG` gives it meaning (it echoes the
    /// `PING` id); everywhere else it is informational.
    pub id: String,
    /// Milliseconds since the Unix epoch at the time the message was built.
    pub timestamp: u64,
    /// The tagged, variant-specific part of the message.
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wraps `body` with a fresh id and the current time.
    pub fn new(body: T) -> Self {
        Self {
            id: new_message_id(),
            timestamp: now_millis(),
            body,
        }
    }

    /// Wraps `body` reusing an existing id (used for `PONG`).
    pub fn with_id(id: impl Into<String>, body: T) -> Self {
        Self {
            id: id.into(),
            timestamp: now_millis(),
            body,
        }
    }
}

/// A message travelling from a controller to the server.
pub type ControllerEnvelope = Envelope<ControllerMsg>;

/// A message travelling from the server to a controller.
pub type ServerEnvelope = Envelope<ServerMsg>;

// ── Controller → Server ───────────────────────────────────────────────────────

/// All messages that a controller can send to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControllerMsg {
    /// Liveness probe.  The server answers with a `PONG` carrying the same id.
    Ping,

    /// Requests the current file catalog.
    GetFileList,

    /// Loads and starts playing a file from the beginning.
    ///
    /// This is also the only way to resume after `PAUSE`.
    Play { file_id: String },

    /// Pauses the current file, keeping it loaded.
    Pause,

    /// Stops playback and unloads the current file.
    Stop,

    /// Sets the output volume.  Values outside `[0.0, 1.0]` are clamped by
    /// the server.
    SetVolume { volume: f64 },

    /// Enables or disables looping of the current file.
    SetLoop {
        #[serde(rename = "loop")]
        looping: bool,
    },

    /// Moves the playback position.  The server does not broadcast after a
    /// seek; the next engine position update carries the new position.
    Seek { position_ms: u64 },

    /// Removes a file from the catalog and from the server's file store.
    DeleteFile { file_id: String },

    /// Announces an upcoming upload on the transfer channel.
    FileTransferStart {
        file_id: String,
        file_name: String,
        file_size: u64,
    },

    /// Turns the server's power-saving (screen dimming) mode on or off.
    SetPowerSaving { enabled: bool },
}

impl ControllerMsg {
    /// Returns the wire name of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerMsg::Ping => "PING",
            ControllerMsg::GetFileList => "GET_FILE_LIST",
            ControllerMsg::Play { .. } => "PLAY",
            ControllerMsg::Pause => "PAUSE",
            ControllerMsg::Stop => "STOP",
            ControllerMsg::SetVolume { .. } => "SET_VOLUME",
            ControllerMsg::SetLoop { .. } => "SET_LOOP",
            ControllerMsg::Seek { .. } => "SEEK",
            ControllerMsg::DeleteFile { .. } => "DELETE_FILE",
            ControllerMsg::FileTransferStart { .. } => "FILE_TRANSFER_START",
            ControllerMsg::SetPowerSaving { .. } => "SET_POWER_SAVING",
        }
    }
}

// ── Server → Controller ───────────────────────────────────────────────────────

/// All messages that the server can send to a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMsg {
    /// Reply to `PING`; the envelope id matches the ping's id.
    Pong,

    /// The complete file catalog.
    FileList { files: Vec<FileInfo> },

    /// The complete authoritative playback state.
    PlaybackState { state: PlaybackState },

    /// Answer to `FILE_TRANSFER_START`.
    FileTransferAck {
        file_id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Outcome of a transfer-channel upload.
    FileTransferDone { file_id: String, success: bool },

    /// A command could not be carried out.  Sent to the requester only.
    Error { code: ErrorCode, message: String },

    /// Current power-saving mode.
    PowerSavingState { enabled: bool },
}

impl ServerMsg {
    /// Returns the wire name of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMsg::Pong => "PONG",
            ServerMsg::FileList { .. } => "FILE_LIST",
            ServerMsg::PlaybackState { .. } => "PLAYBACK_STATE",
            ServerMsg::FileTransferAck { .. } => "FILE_TRANSFER_ACK",
            ServerMsg::FileTransferDone { .. } => "FILE_TRANSFER_DONE",
            ServerMsg::Error { .. } => "ERROR",
            ServerMsg::PowerSavingState { .. } => "POWER_SAVING_STATE",
        }
    }
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Machine-readable codes carried by [`ServerMsg::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The referenced file id is not in the catalog.
    FileNotFound,
    /// The command's arguments were unusable.
    InvalidRequest,
    /// An announced upload was refused.
    TransferRejected,
    /// The server failed to carry out an otherwise valid command.
    InternalError,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
