//! Human-readable system notices for connection lifecycle events, and the
//! recovery advice shown alongside connection errors.

use serde::Serialize;
use vigil_core::{CloseCause, ConnectionError, ConnectionEvent};

/// Fallback for keys missing from the table.
pub const GENERIC_NOTICE: &str =
    "I'm working on a connection issue. Please bear with me while I resolve this.";

const NOTICES: &[(&str, &str)] = &[
    ("connected", "Connected. Ready to help with your analysis!"),
    ("connection_restored", "Connection restored! I'm back online and ready to help."),
    (
        "connection_failed",
        "I'm having trouble connecting right now. Let me try a backup connection to ensure we can continue...",
    ),
    (
        "server_unavailable",
        "Our servers are being updated to serve you better. I'll reconnect automatically once this is complete.",
    ),
    (
        "network_issue",
        "It looks like there might be a network issue. I'll keep trying to connect in the background.",
    ),
    ("reconnecting", "Reconnecting to ensure the best experience for you. Please hold on..."),
    ("retry_attempt", "Still working on the connection. Thank you for your patience..."),
    (
        "fallback_active",
        "I'm using a backup connection to keep helping you. Everything will work normally, though responses might be slightly slower.",
    ),
    (
        "offline_mode",
        "You're currently offline. I'll save your messages and send them once you're connected again.",
    ),
    (
        "queue_messages",
        "Your messages are safely queued and will be sent when connection is restored.",
    ),
    (
        "circuit_breaker",
        "I'm taking a brief pause to ensure the best service quality. Please try again in a few moments.",
    ),
    ("manual_retry_needed", "Please try sending your message again. I'm ready to help!"),
    (
        "timeout_error",
        "The connection is taking longer than usual. Let me try a different approach...",
    ),
    (
        "scheduled_maintenance",
        "Quick maintenance in progress. I'll be back online shortly with improved performance!",
    ),
];

const RETRYABLE: &[&str] = &[
    "connection_failed",
    "network_issue",
    "manual_retry_needed",
    "timeout_error",
];

/// Reconnect attempts after which the pipeline starts reassuring the user.
const QUIET_RETRIES: u32 = 3;

pub fn notice_text(key: &str) -> &'static str {
    NOTICES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, text)| *text)
        .unwrap_or(GENERIC_NOTICE)
}

/// Whether the presentation layer should offer a retry action.
pub fn can_retry(key: &str) -> bool {
    RETRYABLE.contains(&key)
}

/// Notice key for a lifecycle event, if the event deserves one.
///
/// Failures without a dedicated notice fall back to the event's own type,
/// which [`notice_text`] renders as [`GENERIC_NOTICE`].
pub fn notice_for(event: &ConnectionEvent) -> Option<&'static str> {
    match event {
        ConnectionEvent::Opened { after_retry: true } => Some("connection_restored"),
        ConnectionEvent::Closed { code, was_open: true, .. } => {
            Some(match CloseCause::from_code(*code) {
                CloseCause::ServerError => "server_unavailable",
                CloseCause::TryAgainLater => "circuit_breaker",
                _ => "network_issue",
            })
        }
        ConnectionEvent::Errored { was_open: true, .. } => Some("connection_failed"),
        ConnectionEvent::HandshakeTimedOut { .. } => Some("timeout_error"),
        ConnectionEvent::ReconnectScheduled { attempt, .. } if *attempt > QUIET_RETRIES => {
            Some("retry_attempt")
        }
        ConnectionEvent::CircuitOpened { .. } | ConnectionEvent::ConnectRejected { .. } => {
            Some("circuit_breaker")
        }
        ConnectionEvent::AuthRejected { .. }
        | ConnectionEvent::Errored { was_open: false, .. }
        | ConnectionEvent::Closed { was_open: false, .. } => Some(event.event_type()),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    WaitForNetwork,
    AutoRetry,
    FallbackMode,
    WaitAndRetry,
    GeneralRetry,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitForNetwork => "wait_for_network",
            Self::AutoRetry => "auto_retry",
            Self::FallbackMode => "fallback_mode",
            Self::WaitAndRetry => "wait_and_retry",
            Self::GeneralRetry => "general_retry",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Recovery {
    pub message: &'static str,
    pub can_retry: bool,
    pub action: RecoveryAction,
}

const OFFLINE: Recovery = Recovery {
    message: "It looks like you're offline. I'll automatically reconnect when your internet is back!",
    can_retry: false,
    action: RecoveryAction::WaitForNetwork,
};

const SERVER: Recovery = Recovery {
    message: "I'm experiencing a temporary service interruption. Let me try to reconnect...",
    can_retry: true,
    action: RecoveryAction::AutoRetry,
};

const TIMEOUT: Recovery = Recovery {
    message: "The connection is taking longer than usual. Switching to backup mode...",
    can_retry: false,
    action: RecoveryAction::FallbackMode,
};

const RATE_LIMITED: Recovery = Recovery {
    message: "I'm receiving a lot of requests right now. Please wait a moment before trying again.",
    can_retry: true,
    action: RecoveryAction::WaitAndRetry,
};

const UNKNOWN: Recovery = Recovery {
    message: "I encountered an unexpected issue but I'm working to resolve it. Please bear with me!",
    can_retry: true,
    action: RecoveryAction::GeneralRetry,
};

/// Advice for a connection failure.
pub fn recovery_for(error: &ConnectionError) -> Recovery {
    match error {
        ConnectionError::Closed { code, .. } => match CloseCause::from_code(*code) {
            CloseCause::Normal | CloseCause::GoingAway | CloseCause::Abnormal => OFFLINE,
            _ => UNKNOWN,
        },
        ConnectionError::Network(_) => OFFLINE,
        ConnectionError::Server { code, .. } => match CloseCause::from_code(*code) {
            CloseCause::TryAgainLater => RATE_LIMITED,
            _ => SERVER,
        },
        ConnectionError::Protocol(_) | ConnectionError::SendFailed(_) => SERVER,
        ConnectionError::HandshakeTimeout(_) => TIMEOUT,
        ConnectionError::CircuitOpen { .. } => RATE_LIMITED,
        ConnectionError::Exhausted(_) | ConnectionError::ManagerStopped => UNKNOWN,
    }
}
