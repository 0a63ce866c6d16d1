//! Per-turn classification: start, progress, terminal result, timeout.
//!
//! [`TurnTracker`] is a plain state machine fed with envelopes and the
//! current instant. It owns the turn deadline but never sleeps; the pipeline
//! actor waits on [`TurnTracker::deadline`] and calls
//! [`TurnTracker::on_deadline`] when it passes.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vigil_core::{Envelope, ResponseStatus, TurnId};

use crate::classify::shorten_log_line;
use crate::messages::{ChatEvent, ChatMessage};
use crate::notices::{can_retry, notice_text};

const FIRST_STEP: &str = "Starting analysis...";
const EMPTY_ANSWER: &str =
    "Analysis completed successfully, but no detailed response was provided.";
const GENERIC_FAILURE: &str = "The analysis could not be completed.";
const TIMEOUT_KEY: &str = "timeout_error";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Pending {
        turn: TurnId,
        deadline: Instant,
        step: String,
    },
    /// The turn timed out locally. Server frames still in flight for it are
    /// swallowed until its terminal frame arrives or a new turn begins.
    Expired { turn: TurnId },
}

pub struct TurnTracker {
    timeout: Duration,
    state: TurnState,
}

impl TurnTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, TurnState::Pending { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            TurnState::Pending { deadline, .. } => Some(*deadline),
            TurnState::Idle | TurnState::Expired { .. } => None,
        }
    }

    /// Open a turn. A turn that is already pending keeps its id and deadline;
    /// an expired one is forgotten.
    pub fn begin(&mut self, now: Instant) -> Vec<ChatEvent> {
        if self.is_pending() {
            return Vec::new();
        }
        let turn = TurnId::new();
        info!(turn_id = %turn, timeout_ms = self.timeout.as_millis() as u64, "turn started");
        self.state = TurnState::Pending {
            turn: turn.clone(),
            deadline: now + self.timeout,
            step: FIRST_STEP.to_string(),
        };
        vec![ChatEvent::Thinking {
            turn,
            step: FIRST_STEP.to_string(),
        }]
    }

    pub fn on_envelope(&mut self, envelope: &Envelope, now: Instant) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        if self.deadline().is_some_and(|d| now >= d) {
            events.extend(self.on_deadline());
        }

        match envelope {
            Envelope::AnalysisStart { .. } => match &self.state {
                TurnState::Expired { turn } => {
                    debug!(turn_id = %turn, "start frame for an expired turn ignored");
                }
                _ => events.extend(self.begin(now)),
            },
            Envelope::Log { message, .. } => events.extend(self.progress(message)),
            Envelope::AnalysisComplete {
                result,
                analysis_id,
                processing_time,
                ..
            } => {
                let answer = result
                    .as_ref()
                    .and_then(|r| r.ai_response.as_deref())
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or(EMPTY_ANSWER);
                events.extend(self.finish(ChatMessage::assistant(
                    answer,
                    *processing_time,
                    analysis_id.clone(),
                )));
            }
            Envelope::Response {
                status: Some(ResponseStatus::Processing),
                ..
            } => {}
            Envelope::Response {
                status: Some(ResponseStatus::Error),
                response,
                ..
            } => {
                let reason = response
                    .as_ref()
                    .and_then(failure_text)
                    .unwrap_or_else(|| GENERIC_FAILURE.to_string());
                events.extend(self.finish(ChatMessage::error(reason, "analysis_error", true)));
            }
            Envelope::Response {
                response,
                request_id,
                processing_time,
                ..
            } => {
                let answer = response
                    .as_ref()
                    .and_then(answer_text)
                    .unwrap_or_else(|| EMPTY_ANSWER.to_string());
                let elapsed = processing_time.as_ref().and_then(seconds);
                events.extend(self.finish(ChatMessage::assistant(
                    answer,
                    elapsed,
                    request_id.clone(),
                )));
            }
            Envelope::AnalysisError { error, .. } => {
                let reason = if error.trim().is_empty() {
                    GENERIC_FAILURE.to_string()
                } else {
                    error.clone()
                };
                events.extend(self.finish(ChatMessage::error(reason, "analysis_error", true)));
            }
            _ => {}
        }
        events
    }

    /// The deadline passed without a terminal envelope.
    pub fn on_deadline(&mut self) -> Vec<ChatEvent> {
        let TurnState::Pending { turn, .. } = &self.state else {
            return Vec::new();
        };
        let turn = turn.clone();
        self.state = TurnState::Expired { turn: turn.clone() };
        warn!(turn_id = %turn, timeout_ms = self.timeout.as_millis() as u64, "turn timed out");
        vec![
            ChatEvent::ThinkingCleared { turn },
            ChatEvent::Message(ChatMessage::error(
                notice_text(TIMEOUT_KEY),
                TIMEOUT_KEY,
                can_retry(TIMEOUT_KEY),
            )),
        ]
    }

    /// End a pending turn locally with the given notice key, e.g. when the
    /// request never reached the server.
    pub fn abort(&mut self, key: &str) -> Vec<ChatEvent> {
        let TurnState::Pending { turn, .. } = std::mem::replace(&mut self.state, TurnState::Idle)
        else {
            return Vec::new();
        };
        debug!(turn_id = %turn, reason = key, "turn aborted");
        vec![
            ChatEvent::ThinkingCleared { turn },
            ChatEvent::Message(ChatMessage::error(notice_text(key), key, can_retry(key))),
        ]
    }

    /// Drop any pending turn without emitting a result.
    pub fn reset(&mut self) -> Vec<ChatEvent> {
        match std::mem::replace(&mut self.state, TurnState::Idle) {
            TurnState::Pending { turn, .. } => vec![ChatEvent::ThinkingCleared { turn }],
            TurnState::Idle | TurnState::Expired { .. } => Vec::new(),
        }
    }

    fn progress(&mut self, message: &str) -> Vec<ChatEvent> {
        let TurnState::Pending { turn, step, .. } = &mut self.state else {
            debug!("log outside a turn ignored");
            return Vec::new();
        };
        *step = shorten_log_line(message);
        vec![ChatEvent::Thinking {
            turn: turn.clone(),
            step: step.clone(),
        }]
    }

    fn finish(&mut self, message: ChatMessage) -> Vec<ChatEvent> {
        let turn = match std::mem::replace(&mut self.state, TurnState::Idle) {
            TurnState::Pending { turn, .. } => turn,
            TurnState::Expired { turn } => {
                debug!(turn_id = %turn, "late result for an expired turn dropped");
                return Vec::new();
            }
            TurnState::Idle => {
                debug!("terminal envelope outside a turn ignored");
                return Vec::new();
            }
        };
        info!(turn_id = %turn, error = message.is_error(), "turn finished");
        vec![
            ChatEvent::ThinkingCleared { turn },
            ChatEvent::Message(message),
        ]
    }
}

/// Answer text from the newer `response` payload: either a JSON-encoded
/// string or an object carrying `final_result.response`.
fn answer_text(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => answer_text(&parsed),
            _ => non_empty(raw),
        },
        Value::Object(map) => map
            .get("final_result")
            .and_then(|r| r.get("response"))
            .or_else(|| map.get("response"))
            .or_else(|| map.get("ai_response"))
            .and_then(Value::as_str)
            .and_then(non_empty),
        _ => None,
    }
}

fn failure_text(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => failure_text(&parsed),
            _ => non_empty(raw),
        },
        Value::Object(map) => map
            .get("error")
            .or_else(|| map.get("final_result").and_then(|r| r.get("error")))
            .and_then(Value::as_str)
            .and_then(non_empty),
        _ => None,
    }
}

/// Processing time arrives as a number or a numeric string.
fn seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('s').parse().ok(),
        _ => None,
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
