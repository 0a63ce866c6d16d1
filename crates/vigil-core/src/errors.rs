use std::time::Duration;

/// Typed error hierarchy for connection-manager operations.
/// Classifies failures as retryable (transient or server-side) or terminal.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    // Retried automatically up to the attempt threshold
    #[error("network error: {0}")]
    Network(String),
    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error {code}: {reason}")]
    Server { code: u16, reason: String },
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("send failed: {0}")]
    SendFailed(String),

    // Terminal until cool-down or manual intervention
    #[error("connection blocked after {attempts} failed attempts; retry in {}s", retry_in.as_secs())]
    CircuitOpen { attempts: u32, retry_in: Duration },
    #[error("unable to connect after {0} attempts - server may be down")]
    Exhausted(u32),

    // Operational
    #[error("connection manager stopped")]
    ManagerStopped,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Closed { .. }
                | Self::Protocol(_)
                | Self::Server { .. }
                | Self::HandshakeTimeout(_)
                | Self::SendFailed(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Closed { .. } => "closed",
            Self::Protocol(_) => "protocol_error",
            Self::Server { .. } => "server_error",
            Self::HandshakeTimeout(_) => "handshake_timeout",
            Self::SendFailed(_) => "send_failed",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Exhausted(_) => "exhausted",
            Self::ManagerStopped => "manager_stopped",
        }
    }

    /// Classify a transport close into the matching error variant.
    pub fn from_close(code: u16, reason: &str) -> Self {
        let reason = if reason.is_empty() {
            CloseCause::from_code(code).description().to_string()
        } else {
            reason.to_string()
        };
        match CloseCause::from_code(code) {
            CloseCause::Protocol => Self::Protocol(reason),
            CloseCause::ServerError | CloseCause::TryAgainLater => Self::Server { code, reason },
            _ => Self::Closed { code, reason },
        }
    }
}

/// Why a transport connection closed, derived from its close code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCause {
    Normal,
    GoingAway,
    Protocol,
    Abnormal,
    ServerError,
    TryAgainLater,
    Other(u16),
}

impl CloseCause {
    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::Protocol,
            1006 => Self::Abnormal,
            1011 => Self::ServerError,
            1013 => Self::TryAgainLater,
            other => Self::Other(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Connection closed normally",
            Self::GoingAway => "Server going away",
            Self::Protocol => "WebSocket protocol error",
            Self::Abnormal => "Connection closed abnormally - server may be down or overloaded",
            Self::ServerError => "Server error - backend may be unhealthy",
            Self::TryAgainLater => "Authentication failed or IP blocked",
            Self::Other(_) => "Connection lost",
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Normal | Self::GoingAway)
    }
}

/// Malformed frame on the wire.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
    #[error("credential rejected: {0}")]
    Rejected(String),
}
