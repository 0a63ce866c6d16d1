pub mod envelope;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod status;

pub use envelope::{Envelope, LogLevel, ResponseStatus, SessionDescriptor};
pub use errors::{CloseCause, ConnectionError, EnvelopeError, IdentityError};
pub use identity::{IdentityBinder, IdentityProvider};
pub use ids::{ClientToken, ConnectionId, MessageId, TurnId};
pub use status::{ConnectionEvent, ConnectionState, ConnectionStatus};
