pub mod dispatcher;
pub mod machine;
pub mod manager;
pub mod mock;
pub mod policy;
pub mod queue;
pub mod timers;
pub mod transport;
pub mod ws;

pub use dispatcher::{Dispatcher, Subscription};
pub use manager::{ConnectOutcome, ConnectionHandle, ConnectionManager, ManagerConfig, SendOutcome};
pub use policy::ReconnectPolicy;
pub use transport::{Transport, TransportEvent, TransportEventKind, TransportLink};
pub use ws::{WsConfig, WsTransport};
