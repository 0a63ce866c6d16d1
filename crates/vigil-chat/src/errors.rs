use vigil_core::ConnectionError;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("a turn is already in flight")]
    TurnInFlight,
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("chat pipeline stopped")]
    PipelineStopped,
}

impl ChatError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TurnInFlight => "turn_in_flight",
            Self::EmptyPrompt => "empty_prompt",
            Self::Connection(err) => err.error_kind(),
            Self::PipelineStopped => "pipeline_stopped",
        }
    }
}
