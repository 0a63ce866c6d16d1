use std::time::Duration;

use serde::Serialize;

/// Primary lifecycle state of the single managed connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    /// The manager tore the live link down itself and is waiting for the
    /// transport to confirm before counting the failure.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        })
    }
}

/// Snapshot exposed to the presentation layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub circuit_open: bool,
    pub last_error: Option<String>,
    pub authenticated: bool,
    pub queued: usize,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }
}

/// Lifecycle notifications published by the connection manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting { attempt: u32 },
    Opened { after_retry: bool },
    Closed { code: u16, reason: String, was_clean: bool, was_open: bool },
    Errored { message: String, was_open: bool },
    HandshakeTimedOut { after: Duration },
    ReconnectScheduled { attempt: u32, delay: Duration },
    CircuitOpened { attempts: u32, cooldown: Duration },
    CircuitClosed,
    ConnectRejected { reason: String },
    /// Caller-initiated disconnect; never followed by a reconnect.
    Disconnected,
    AuthAccepted,
    AuthRejected { error: String },
}

impl ConnectionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => "connecting",
            Self::Opened { .. } => "opened",
            Self::Closed { .. } => "closed",
            Self::Errored { .. } => "errored",
            Self::HandshakeTimedOut { .. } => "handshake_timed_out",
            Self::ReconnectScheduled { .. } => "reconnect_scheduled",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitClosed => "circuit_closed",
            Self::ConnectRejected { .. } => "connect_rejected",
            Self::Disconnected => "disconnected",
            Self::AuthAccepted => "auth_accepted",
            Self::AuthRejected { .. } => "auth_rejected",
        }
    }
}
