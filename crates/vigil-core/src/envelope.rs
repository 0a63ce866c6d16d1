use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EnvelopeError;
use crate::ids::ClientToken;

/// One discrete message unit exchanged over the persistent connection.
///
/// Crosses the transport as a single JSON text frame whose `type` field is the
/// discriminant. Inbound frames without a `timestamp` are stamped with the
/// receipt time; unknown discriminants decode as [`Envelope::Unknown`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    // Outbound
    AnalysisRequest {
        prompt: String,
        client_id: ClientToken,
        session_data: SessionDescriptor,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    Authenticate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<BearerToken>,
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default)]
        anonymous: bool,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    // Inbound
    AnalysisStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        analysis_id: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    Log {
        #[serde(default)]
        level: LogLevel,
        #[serde(default)]
        message: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    AnalysisComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<AnalysisResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        analysis_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processing_time: Option<f64>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    /// Newer backend result format. `response` is either a JSON-encoded
    /// string or an object carrying `final_result`.
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ResponseStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processing_time: Option<Value>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    AnalysisError {
        #[serde(default)]
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        analysis_id: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    AuthSuccess {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    AuthError {
        #[serde(default)]
        error: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    #[serde(other)]
    Unknown,
}

/// Minimal session descriptor attached to analysis requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub user_id: Option<String>,
    pub is_anonymous: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Processing,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_response: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Short-lived bearer credential carried by the `authenticate` frame.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

impl Envelope {
    pub fn heartbeat() -> Self {
        Self::Heartbeat { timestamp: Utc::now() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AnalysisRequest { .. } => "analysis_request",
            Self::Authenticate { .. } => "authenticate",
            Self::Heartbeat { .. } => "heartbeat",
            Self::AnalysisStart { .. } => "analysis_start",
            Self::Log { .. } => "log",
            Self::AnalysisComplete { .. } => "analysis_complete",
            Self::Response { .. } => "response",
            Self::AnalysisError { .. } => "analysis_error",
            Self::AuthSuccess { .. } => "auth_success",
            Self::AuthError { .. } => "auth_error",
            Self::Unknown => "unknown",
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::AnalysisRequest { timestamp, .. }
            | Self::Authenticate { timestamp, .. }
            | Self::Heartbeat { timestamp }
            | Self::AnalysisStart { timestamp, .. }
            | Self::Log { timestamp, .. }
            | Self::AnalysisComplete { timestamp, .. }
            | Self::Response { timestamp, .. }
            | Self::AnalysisError { timestamp, .. }
            | Self::AuthSuccess { timestamp }
            | Self::AuthError { timestamp, .. } => Some(*timestamp),
            Self::Unknown => None,
        }
    }

    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            Self::AnalysisRequest { .. } | Self::Authenticate { .. } | Self::Heartbeat { .. }
        )
    }

    /// True for envelopes that end a turn, successfully or not.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::AnalysisComplete { .. } | Self::AnalysisError { .. } => true,
            Self::Response { status, .. } => !matches!(status, Some(ResponseStatus::Processing)),
            _ => false,
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn analysis_request_roundtrip() {
        let env = Envelope::AnalysisRequest {
            prompt: "audit this contract".into(),
            client_id: ClientToken::from_raw("anon_k3j4h5g6f7d8"),
            session_data: SessionDescriptor {
                session_id: "anon_k3j4h5g6f7d8".into(),
                user_id: None,
                is_anonymous: true,
            },
            timestamp: ts(),
        };
        let frame = env.encode().unwrap();
        assert!(frame.contains("\"type\":\"analysis_request\""));
        assert!(frame.contains("\"client_id\":\"anon_k3j4h5g6f7d8\""));

        let decoded = Envelope::decode(&frame).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.kind(), "analysis_request");
    }

    #[test]
    fn authenticate_uses_camel_case_user_id() {
        let env = Envelope::Authenticate {
            token: Some(BearerToken::new("jwt.abc")),
            user_id: Some("user_2x".into()),
            anonymous: false,
            timestamp: ts(),
        };
        let frame = env.encode().unwrap();
        assert!(frame.contains("\"userId\":\"user_2x\""));
        assert_eq!(Envelope::decode(&frame).unwrap(), env);
    }

    #[test]
    fn bearer_token_debug_is_redacted() {
        let token = BearerToken::new("super-secret");
        assert_eq!(format!("{token:?}"), "BearerToken(***)");
        assert_eq!(token.expose(), "super-secret");
    }

    #[test]
    fn decodes_inbound_log_frame() {
        let frame = r#"{"type":"log","level":"success","message":"AI analysis complete","timestamp":"2026-03-01T12:00:00Z"}"#;
        let env = Envelope::decode(frame).unwrap();
        match env {
            Envelope::Log { level, message, timestamp } => {
                assert_eq!(level, LogLevel::Success);
                assert_eq!(message, "AI analysis complete");
                assert_eq!(timestamp, ts());
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn missing_timestamp_defaults_to_receipt_time() {
        let before = Utc::now();
        let env = Envelope::decode(r#"{"type":"analysis_start"}"#).unwrap();
        let stamped = env.timestamp().unwrap();
        assert!(stamped >= before);
    }

    #[test]
    fn analysis_complete_keeps_extra_result_fields() {
        let frame = r#"{"type":"analysis_complete","result":{"ai_response":"No issues found.","analysis_data":{"score":9}},"processing_time":2.5}"#;
        let env = Envelope::decode(frame).unwrap();
        let Envelope::AnalysisComplete { result: Some(result), processing_time, .. } = env else {
            panic!("expected analysis_complete");
        };
        assert_eq!(result.ai_response.as_deref(), Some("No issues found."));
        assert!(result.extra.contains_key("analysis_data"));
        assert_eq!(processing_time, Some(2.5));
    }

    #[test]
    fn unknown_discriminant_is_not_an_error() {
        let env = Envelope::decode(r#"{"type":"server_banner","text":"hi"}"#).unwrap();
        assert_eq!(env, Envelope::Unknown);
        assert!(env.timestamp().is_none());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"prompt":"no type"}"#).is_err());
        assert!(Envelope::decode(r#"{"type":"analysis_request"}"#).is_err());
    }

    #[test]
    fn terminal_classification() {
        let done = Envelope::AnalysisComplete {
            result: None,
            analysis_id: None,
            processing_time: None,
            timestamp: ts(),
        };
        assert!(done.is_terminal());

        let processing = Envelope::Response {
            status: Some(ResponseStatus::Processing),
            response: None,
            request_id: None,
            processing_time: None,
            timestamp: ts(),
        };
        assert!(!processing.is_terminal());

        let failed = Envelope::Response {
            status: Some(ResponseStatus::Error),
            response: None,
            request_id: None,
            processing_time: None,
            timestamp: ts(),
        };
        assert!(failed.is_terminal());

        assert!(!Envelope::heartbeat().is_terminal());
        assert!(Envelope::heartbeat().is_outbound());
    }
}
