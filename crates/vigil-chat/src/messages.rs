use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_core::{MessageId, TurnId};

use crate::notices::{can_retry, notice_text, Recovery};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Error,
    System,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub can_retry: bool,
    /// Backend-reported processing time, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub is_connection_message: bool,
}

/// One finalized conversational message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl ChatMessage {
    fn build(role: Role, kind: MessageKind, content: String, metadata: MessageMetadata) -> Self {
        Self {
            id: MessageId::new(),
            role,
            kind,
            content,
            timestamp: Utc::now(),
            metadata,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::build(Role::User, MessageKind::Text, content.into(), MessageMetadata::default())
    }

    pub fn assistant(
        content: impl Into<String>,
        processing_time: Option<f64>,
        correlation_id: Option<String>,
    ) -> Self {
        Self::build(
            Role::Assistant,
            MessageKind::Text,
            content.into(),
            MessageMetadata {
                processing_time,
                correlation_id,
                ..Default::default()
            },
        )
    }

    /// System notice looked up by key.
    pub fn notice(key: &str) -> Self {
        Self::build(
            Role::System,
            MessageKind::System,
            notice_text(key).to_string(),
            MessageMetadata {
                event_type: Some(key.to_string()),
                can_retry: can_retry(key),
                is_connection_message: true,
                ..Default::default()
            },
        )
    }

    /// Recoverable error shown in place of an answer.
    pub fn error(content: impl Into<String>, event_type: &str, can_retry: bool) -> Self {
        Self::build(
            Role::Assistant,
            MessageKind::Error,
            content.into(),
            MessageMetadata {
                event_type: Some(event_type.to_string()),
                can_retry,
                ..Default::default()
            },
        )
    }

    /// Connection failure advice, tagged with its recovery action.
    pub fn recovery(recovery: &Recovery) -> Self {
        Self::build(
            Role::System,
            MessageKind::Error,
            recovery.message.to_string(),
            MessageMetadata {
                event_type: Some(recovery.action.as_str().to_string()),
                can_retry: recovery.can_retry,
                is_connection_message: true,
                ..Default::default()
            },
        )
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }
}

/// What the presentation layer receives from the chat pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    /// A turn is pending; `step` is the latest progress line.
    Thinking { turn: TurnId, step: String },
    ThinkingCleared { turn: TurnId },
    Message(ChatMessage),
}

impl ChatEvent {
    pub fn message(&self) -> Option<&ChatMessage> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_message_carries_flags() {
        let msg = ChatMessage::notice("timeout_error");
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.kind, MessageKind::System);
        assert!(msg.metadata.can_retry);
        assert!(msg.metadata.is_connection_message);
        assert_eq!(msg.metadata.event_type.as_deref(), Some("timeout_error"));
    }

    #[test]
    fn assistant_message_serializes_metadata() {
        let msg = ChatMessage::assistant("No issues found.", Some(1.25), Some("req-7".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["kind"], "text");
        assert_eq!(json["metadata"]["processing_time"], 1.25);
        assert_eq!(json["metadata"]["correlation_id"], "req-7");
        assert!(json["metadata"].get("event_type").is_none());
        assert!(msg.id.as_str().starts_with("msg_"));
    }

    #[test]
    fn error_message_is_flagged() {
        let msg = ChatMessage::error("backend exploded", "analysis_error", true);
        assert!(msg.is_error());
        assert!(msg.metadata.can_retry);
    }

    #[test]
    fn recovery_message_names_its_action() {
        let err = vigil_core::ConnectionError::from_close(1013, "busy");
        let msg = ChatMessage::recovery(&crate::notices::recovery_for(&err));
        assert_eq!(msg.role, Role::System);
        assert!(msg.is_error());
        assert!(msg.metadata.can_retry);
        assert_eq!(msg.metadata.event_type.as_deref(), Some("wait_and_retry"));
    }
}
