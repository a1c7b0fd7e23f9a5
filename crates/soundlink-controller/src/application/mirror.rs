//! Controller-side copy of the server's state.
//!
//! The server is authoritative.  The controller never changes this mirror on
//! its own; it only replays what the server broadcasts:
//!
//! | Server message       | Mirror field            |
//! |----------------------|-------------------------|
//! | `FILE_LIST`          | `files`                 |
//! | `PLAYBACK_STATE`     | `playback`              |
//! | `POWER_SAVING_STATE` | `power_saving`          |
//! | `FILE_TRANSFER_ACK`  | `transfers` (pending)   |
//! | `FILE_TRANSFER_DONE` | `transfers` (finished)  |
//! | `ERROR`              | `last_error`            |
//!
//! Connection status changes come from the client itself.  Losing the
//! connection clears everything learned from the server, because none of
//! it can be trusted once the stream of broadcasts stops.

use std::collections::HashMap;

use soundlink_core::protocol::ServerEnvelope;
use soundlink_core::{ErrorCode, FileInfo, PlaybackState, ServerMsg};

use super::events::{ClientEvent, ConnectionStatus};

/// Where an upload stands, as far as the server has told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferProgress {
    /// The server accepted `FILE_TRANSFER_START`; bytes may be in flight.
    Accepted,
    /// The server refused the upload.
    Refused(Option<String>),
    /// The server finished receiving the file.
    Done { success: bool },
}

/// The last `ERROR` the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
}

/// Everything the controller has heard from the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMirror {
    pub status: ConnectionStatus,
    pub status_cause: Option<String>,
    pub files: Vec<FileInfo>,
    /// `None` until the first `PLAYBACK_STATE` arrives.
    pub playback: Option<PlaybackState>,
    pub power_saving: Option<bool>,
    pub transfers: HashMap<String, TransferProgress>,
    pub last_error: Option<ServerError>,
}

impl ServerMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one client event into the mirror.
    pub fn apply(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::Status { status, cause } => {
                self.status = *status;
                self.status_cause = cause.clone();
                if matches!(
                    status,
                    ConnectionStatus::Disconnected | ConnectionStatus::Error
                ) {
                    self.forget_server();
                }
            }
            ClientEvent::Message(envelope) => self.apply_message(envelope),
        }
    }

    /// Folds one server message into the mirror.
    pub fn apply_message(&mut self, envelope: &ServerEnvelope) {
        match &envelope.body {
            ServerMsg::Pong => {}
            ServerMsg::FileList { files } => self.files = files.clone(),
            ServerMsg::PlaybackState { state } => self.playback = Some(state.clone()),
            ServerMsg::FileTransferAck {
                file_id,
                accepted,
                reason,
            } => {
                let progress = if *accepted {
                    TransferProgress::Accepted
                } else {
                    TransferProgress::Refused(reason.clone())
                };
                self.transfers.insert(file_id.clone(), progress);
            }
            ServerMsg::FileTransferDone { file_id, success } => {
                self.transfers.insert(
                    file_id.clone(),
                    TransferProgress::Done { success: *success },
                );
            }
            ServerMsg::Error { code, message } => {
                self.last_error = Some(ServerError {
                    code: *code,
                    message: message.clone(),
                });
            }
            ServerMsg::PowerSavingState { enabled } => self.power_saving = Some(*enabled),
        }
    }

    pub fn file(&self, id: &str) -> Option<&FileInfo> {
        self.files.iter().find(|f| f.id == id)
    }

    /// The file currently loaded on the server, if it is in the list.
    pub fn current_file(&self) -> Option<&FileInfo> {
        let id = self.playback.as_ref()?.current_file_id.as_deref()?;
        self.file(id)
    }

    /// Drops everything learned from the server, keeping the status.
    pub fn forget_server(&mut self) {
        self.files.clear();
        self.playback = None;
        self.power_saving = None;
        self.transfers.clear();
        self.last_error = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
