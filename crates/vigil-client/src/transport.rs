use tokio::sync::mpsc;
use vigil_core::ConnectionId;

/// Raw lifecycle events emitted by a transport link, tagged with the
/// connection they belong to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    pub conn: ConnectionId,
    pub kind: TransportEventKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEventKind {
    Opened,
    Received(String),
    Closed { code: u16, reason: String, was_clean: bool },
    Errored(String),
}

impl TransportEventKind {
    /// Closed and Errored end a link; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Errored(_))
    }
}

/// Factory for full-duplex text links.
///
/// Each link reports at most one `Opened`, then any number of `Received`,
/// and ends with exactly one `Closed` or `Errored`.
pub trait Transport: Send + Sync + 'static {
    fn open(
        &self,
        url: &str,
        conn: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn TransportLink>;
}

/// The caller's side of one live link.
pub trait TransportLink: Send {
    /// Hand a text frame to the link. False when the link cannot take it.
    fn send(&self, frame: String) -> bool;

    /// Start closing. The terminal event still arrives on the event channel.
    fn close(&self, code: u16, reason: &str);
}
