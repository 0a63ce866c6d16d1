use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use vigil_core::{ConnectionId, Envelope};

use crate::transport::{Transport, TransportEvent, TransportEventKind, TransportLink};

/// Scripted outcome for one `open` call.
#[derive(Clone, Debug)]
pub enum MockOpen {
    /// Emit `Opened` right away.
    Accept,
    /// Emit `Errored` right away, like a refused TCP connect.
    Refuse(String),
    /// Never complete the handshake; the test drives it with [`MockTransport::accept`].
    Hang,
}

struct MockLinkState {
    conn: ConnectionId,
    events: mpsc::UnboundedSender<TransportEvent>,
    opened: bool,
    live: bool,
    close_code: Option<u16>,
}

impl MockLinkState {
    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            conn: self.conn,
            kind,
        });
    }
}

struct Shared {
    script: VecDeque<MockOpen>,
    fallback: MockOpen,
    links: Vec<MockLinkState>,
    sent: Vec<String>,
    live: usize,
    max_live: usize,
    send_budget: Option<usize>,
}

impl Shared {
    fn link_mut(&mut self, conn: ConnectionId) -> Option<&mut MockLinkState> {
        self.links.iter_mut().find(|l| l.conn == conn)
    }

    fn latest_live(&mut self) -> Option<&mut MockLinkState> {
        self.links.iter_mut().rev().find(|l| l.live)
    }

    fn end(&mut self, conn: ConnectionId, kind: TransportEventKind) -> bool {
        let Some(link) = self.link_mut(conn) else {
            return false;
        };
        if !link.live {
            return false;
        }
        link.live = false;
        if let TransportEventKind::Closed { code, .. } = &kind {
            link.close_code = Some(*code);
        }
        link.emit(kind);
        self.live -= 1;
        true
    }
}

/// Transport double with scripted handshakes and remote-side controls.
///
/// Clones share state: hand one clone to the connection manager and drive
/// the "server" side through another.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MockTransport {
    /// Each `open` consumes the next scripted outcome, then falls back to
    /// [`MockOpen::Hang`].
    pub fn new(script: Vec<MockOpen>) -> Self {
        Self::with_fallback(script, MockOpen::Hang)
    }

    pub fn with_fallback(script: Vec<MockOpen>, fallback: MockOpen) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                script: script.into(),
                fallback,
                links: Vec::new(),
                sent: Vec::new(),
                live: 0,
                max_live: 0,
                send_budget: None,
            })),
        }
    }

    /// Every open succeeds immediately.
    pub fn accepting() -> Self {
        Self::with_fallback(Vec::new(), MockOpen::Accept)
    }

    /// Every open is refused immediately.
    pub fn refusing() -> Self {
        Self::with_fallback(Vec::new(), MockOpen::Refuse("connection refused".into()))
    }

    /// Complete the handshake of the newest pending link.
    pub fn accept(&self) -> bool {
        let mut shared = self.shared.lock();
        match shared.latest_live() {
            Some(link) if !link.opened => {
                link.opened = true;
                link.emit(TransportEventKind::Opened);
                true
            }
            _ => false,
        }
    }

    /// Deliver an envelope from the server on the newest open link.
    pub fn push(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(frame) => self.push_raw(frame),
            Err(_) => false,
        }
    }

    pub fn push_raw(&self, frame: impl Into<String>) -> bool {
        let mut shared = self.shared.lock();
        match shared.latest_live() {
            Some(link) if link.opened => {
                link.emit(TransportEventKind::Received(frame.into()));
                true
            }
            _ => false,
        }
    }

    /// Server-side close of the newest live link.
    pub fn drop_connection(&self, code: u16, reason: &str) -> bool {
        let mut shared = self.shared.lock();
        let Some(conn) = shared.latest_live().map(|l| l.conn) else {
            return false;
        };
        shared.end(
            conn,
            TransportEventKind::Closed {
                code,
                reason: reason.to_string(),
                was_clean: matches!(code, 1000 | 1001),
            },
        )
    }

    /// Transport error on the newest live link.
    pub fn fail(&self, message: &str) -> bool {
        let mut shared = self.shared.lock();
        let Some(conn) = shared.latest_live().map(|l| l.conn) else {
            return false;
        };
        shared.end(conn, TransportEventKind::Errored(message.to_string()))
    }

    /// Allow `n` more successful sends, then refuse every send.
    pub fn fail_sends_after(&self, n: usize) {
        self.shared.lock().send_budget = Some(n);
    }

    pub fn restore_sends(&self) {
        self.shared.lock().send_budget = None;
    }

    /// Queue more scripted open outcomes.
    pub fn script(&self, outcomes: impl IntoIterator<Item = MockOpen>) {
        self.shared.lock().script.extend(outcomes);
    }

    pub fn opens(&self) -> usize {
        self.shared.lock().links.len()
    }

    pub fn live(&self) -> usize {
        self.shared.lock().live
    }

    /// Highest number of simultaneously live links ever observed.
    pub fn max_live(&self) -> usize {
        self.shared.lock().max_live
    }

    /// Every frame accepted across all links, in send order.
    pub fn sent(&self) -> Vec<String> {
        self.shared.lock().sent.clone()
    }

    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .iter()
            .filter_map(|frame| Envelope::decode(frame).ok())
            .collect()
    }

    /// Close code of a link the client closed, if it was closed.
    pub fn close_code(&self, conn: ConnectionId) -> Option<u16> {
        self.shared
            .lock()
            .links
            .iter()
            .find(|l| l.conn == conn)
            .and_then(|l| l.close_code)
    }

    pub fn is_closed(&self, conn: ConnectionId) -> bool {
        self.shared
            .lock()
            .links
            .iter()
            .find(|l| l.conn == conn)
            .is_some_and(|l| !l.live)
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        _url: &str,
        conn: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn TransportLink> {
        let mut shared = self.shared.lock();
        let outcome = shared
            .script
            .pop_front()
            .unwrap_or_else(|| shared.fallback.clone());

        let link = MockLinkState {
            conn,
            events,
            opened: false,
            live: true,
            close_code: None,
        };
        shared.links.push(link);
        shared.live += 1;
        shared.max_live = shared.max_live.max(shared.live);

        match outcome {
            MockOpen::Accept => {
                if let Some(link) = shared.link_mut(conn) {
                    link.opened = true;
                    link.emit(TransportEventKind::Opened);
                }
            }
            MockOpen::Refuse(message) => {
                shared.end(conn, TransportEventKind::Errored(message));
            }
            MockOpen::Hang => {}
        }

        Box::new(MockLink {
            conn,
            shared: Arc::clone(&self.shared),
        })
    }
}

struct MockLink {
    conn: ConnectionId,
    shared: Arc<Mutex<Shared>>,
}

impl TransportLink for MockLink {
    fn send(&self, frame: String) -> bool {
        let mut shared = self.shared.lock();
        let usable = shared
            .link_mut(self.conn)
            .is_some_and(|l| l.live && l.opened);
        if !usable {
            return false;
        }
        match shared.send_budget {
            Some(0) => return false,
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        shared.sent.push(frame);
        true
    }

    fn close(&self, code: u16, reason: &str) {
        self.shared.lock().end(
            self.conn,
            TransportEventKind::Closed {
                code,
                reason: reason.to_string(),
                was_clean: true,
            },
        );
    }
}
