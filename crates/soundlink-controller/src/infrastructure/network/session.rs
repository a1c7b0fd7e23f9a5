//! A connected control session with its state mirror.
//!
//! [`RemoteSession`] bundles a [`ControllerClient`], its event receiver and a
//! [`ServerMirror`], and adds the request/reply waits a one-shot command
//! needs:
//!
//! - [`RemoteSession::open`] returns once the connect snapshot
//!   (`FILE_LIST`, `PLAYBACK_STATE`, `POWER_SAVING_STATE`) has arrived.
//! - [`RemoteSession::request`] sends a command and waits for the first
//!   server message of the expected kind.  An `ERROR` arriving first fails
//!   the request.
//! - [`RemoteSession::upload`] runs the whole upload handshake:
//!
//! ```text
//! controller                           server
//!    │── FILE_TRANSFER_START ─────────────>│   control port
//!    │<──────────── FILE_TRANSFER_ACK ─────│
//!    │== header + bytes ==================>│   transfer port
//!    │<──────────── FILE_LIST ─────────────│   (on success)
//!    │<──────────── FILE_TRANSFER_DONE ────│
//! ```

use std::path::Path;
use std::time::Duration;

use soundlink_core::protocol::ServerEnvelope;
use soundlink_core::{ControllerMsg, ErrorCode, ServerMsg};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ClientConfig, ClientEvent, ConnectionStatus, ControllerClient};
use crate::application::mirror::{ServerMirror, TransferProgress};
use crate::infrastructure::transfer::{upload_file, TransferError, TransferTarget};

/// Errors from [`RemoteSession`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection closed or failed.
    #[error("connection closed{}", cause.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    Closed { cause: Option<String> },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The command could not be queued.
    #[error("not connected")]
    NotConnected,

    /// The server answered with `ERROR`.
    #[error("server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("upload refused{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Refused { reason: Option<String> },

    /// The server did not store the uploaded file.
    #[error("server reported upload {0} as failed")]
    UploadFailed(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// A live control session.
pub struct RemoteSession {
    host: String,
    client: ControllerClient,
    events: mpsc::Receiver<ClientEvent>,
    mirror: ServerMirror,
}

impl RemoteSession {
    /// Connects to `host:port` and waits up to `wait` for the snapshot.
    pub async fn open(
        host: impl Into<String>,
        port: u16,
        config: ClientConfig,
        wait: Duration,
    ) -> Result<Self, SessionError> {
        let host = host.into();
        let client = ControllerClient::new(config);
        let events = client.connect(host.clone(), port);
        let mut session = Self {
            host,
            client,
            events,
            mirror: ServerMirror::new(),
        };
        // The snapshot arrives in order, so seeing the last message means
        // the file list and playback state are already in.
        session
            .wait_until("the initial state", wait, |m| {
                m.status.is_connected() && m.playback.is_some() && m.power_saving.is_some()
            })
            .await?;
        debug!("session with {} ready", session.host);
        Ok(session)
    }

    pub fn mirror(&self) -> &ServerMirror {
        &self.mirror
    }

    pub fn client(&self) -> &ControllerClient {
        &self.client
    }

    /// Waits up to `wait` for the next event and folds it into the mirror.
    ///
    /// Returns `None` on timeout.
    pub async fn next_event(&mut self, wait: Duration) -> Result<Option<ClientEvent>, SessionError> {
        match timeout_at(Instant::now() + wait, self.events.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(self.closed()),
            Ok(Some(event)) => {
                self.mirror.apply(&event);
                Ok(Some(event))
            }
        }
    }

    /// Processes events until `done` holds for the mirror.
    pub async fn wait_until<F>(
        &mut self,
        what: &str,
        wait: Duration,
        mut done: F,
    ) -> Result<(), SessionError>
    where
        F: FnMut(&ServerMirror) -> bool,
    {
        let deadline = Instant::now() + wait;
        while !done(&self.mirror) {
            let event = self.recv_before(deadline, what).await?;
            if let ClientEvent::Status { status, cause } = &event {
                if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Error) {
                    return Err(SessionError::Closed {
                        cause: cause.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Sends `body` and waits for the first message `expect` accepts.
    pub async fn request<F>(
        &mut self,
        body: ControllerMsg,
        what: &str,
        wait: Duration,
        mut expect: F,
    ) -> Result<ServerEnvelope, SessionError>
    where
        F: FnMut(&ServerMsg) -> bool,
    {
        let kind = body.kind();
        if !self.client.send(body) {
            return Err(SessionError::NotConnected);
        }
        debug!("sent {kind}; waiting for {what}");

        let deadline = Instant::now() + wait;
        loop {
            match self.recv_before(deadline, what).await? {
                ClientEvent::Message(envelope) => match &envelope.body {
                    ServerMsg::Error { code, message } => {
                        return Err(SessionError::Server {
                            code: *code,
                            message: message.clone(),
                        })
                    }
                    body if expect(body) => return Ok(envelope),
                    _ => {}
                },
                ClientEvent::Status { status, cause } => {
                    if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Error) {
                        return Err(SessionError::Closed { cause });
                    }
                }
            }
        }
    }

    /// Sends a command the server does not answer (such as `SEEK`) and
    /// confirms it with a PING.
    ///
    /// The server handles one session's messages in order, so an `ERROR`
    /// for the command arrives before the `PONG`.
    pub async fn fire(&mut self, body: ControllerMsg, wait: Duration) -> Result<(), SessionError> {
        if !self.client.send(body) {
            return Err(SessionError::NotConnected);
        }
        self.request(ControllerMsg::Ping, "PONG", wait, |m| {
            matches!(m, ServerMsg::Pong)
        })
        .await
        .map(|_| ())
    }

    /// Uploads `path` under a fresh file id and waits for the server to
    /// confirm it.
    ///
    /// Returns the new file id.
    pub async fn upload<P>(
        &mut self,
        path: &Path,
        transfer_port: u16,
        wait: Duration,
        on_progress: P,
    ) -> Result<String, SessionError>
    where
        P: FnMut(f64),
    {
        let file_id = Uuid::new_v4().to_string();
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|source| TransferError::Source {
                path: path.display().to_string(),
                source,
            })?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.clone());

        let start = ControllerMsg::FileTransferStart {
            file_id: file_id.clone(),
            file_name: name,
            file_size: size,
        };
        let id = file_id.clone();
        let ack = self
            .request(start, "FILE_TRANSFER_ACK", wait, |m| {
                matches!(m, ServerMsg::FileTransferAck { file_id, .. } if *file_id == id)
            })
            .await?;
        if let ServerMsg::FileTransferAck {
            accepted: false,
            reason,
            ..
        } = ack.body
        {
            return Err(SessionError::Refused { reason });
        }

        let target = TransferTarget::new(self.host.clone()).with_port(transfer_port);
        upload_file(&target, path, &file_id, on_progress).await?;

        let id = file_id.clone();
        let mut success = None;
        self.wait_until("FILE_TRANSFER_DONE", wait, |m| {
            if let Some(TransferProgress::Done { success: s }) = m.transfers.get(&id) {
                success = Some(*s);
            }
            success.is_some()
        })
        .await?;

        if success == Some(true) {
            info!("upload {file_id} stored");
            Ok(file_id)
        } else {
            Err(SessionError::UploadFailed(file_id))
        }
    }

    /// Closes the connection.
    pub fn close(&self) {
        self.client.disconnect();
    }

    async fn recv_before(&mut self, deadline: Instant, what: &str) -> Result<ClientEvent, SessionError> {
        match timeout_at(deadline, self.events.recv()).await {
            Err(_) => Err(SessionError::Timeout(what.to_string())),
            Ok(None) => Err(self.closed()),
            Ok(Some(event)) => {
                self.mirror.apply(&event);
                Ok(event)
            }
        }
    }

    fn closed(&self) -> SessionError {
        SessionError::Closed {
            cause: self.mirror.status_cause.clone(),
        }
    }
}
