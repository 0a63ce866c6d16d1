pub mod classify;
pub mod errors;
pub mod messages;
pub mod notices;
pub mod pipeline;
pub mod session;
pub mod turn;

pub use classify::shorten_log_line;
pub use errors::ChatError;
pub use messages::{ChatEvent, ChatMessage, MessageKind, MessageMetadata, Role};
pub use notices::{can_retry, notice_for, notice_text, recovery_for, Recovery, RecoveryAction};
pub use pipeline::{ChatPipeline, PipelineConfig, PipelineHandle};
pub use session::ChatSession;
pub use turn::{TurnState, TurnTracker};
