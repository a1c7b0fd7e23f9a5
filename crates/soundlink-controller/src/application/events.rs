//! What a control connection reports to its owner.

use soundlink_core::protocol::ServerEnvelope;

/// Lifecycle of a control connection.
///
/// ```text
/// Idle ──connect──> Connecting ──ok──────> Connected ──close──> Disconnected
///                        │                     │
///                        └─refused/timeout─> Error <─reset──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No connection has been attempted yet.
    #[default]
    Idle,
    /// TCP connect in progress.
    Connecting,
    /// The control channel is open.
    Connected,
    /// The connection closed cleanly (by either side).
    Disconnected,
    /// The connection failed or broke; the event carries the cause.
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

/// Event delivered on the receiver returned by `ControllerClient::connect`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection changed state.  `cause` is a human-readable reason for
    /// [`ConnectionStatus::Error`].
    Status {
        status: ConnectionStatus,
        cause: Option<String>,
    },
    /// A message arrived from the server.
    Message(ServerEnvelope),
}

impl ClientEvent {
    pub fn status(status: ConnectionStatus) -> Self {
        Self::Status {
            status,
            cause: None,
        }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        Self::Status {
            status: ConnectionStatus::Error,
            cause: Some(cause.into()),
        }
    }
}
