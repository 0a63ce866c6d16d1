//! WebSocket transport over `tokio-tungstenite`.
//!
//! One spawned task per link: it runs the handshake, then multiplexes
//! outgoing frames, incoming frames and keepalive pings in a single loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;
use vigil_core::{CloseCause, ConnectionId};

use crate::transport::{Transport, TransportEvent, TransportEventKind, TransportLink};

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Clone, Debug)]
pub struct WsConfig {
    /// Bounded writer queue per link; a full queue fails the send.
    pub send_queue_capacity: usize,
    pub heartbeat_interval: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WsTransport {
    config: WsConfig,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }
}

enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

impl Transport for WsTransport {
    fn open(
        &self,
        url: &str,
        conn: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn TransportLink> {
        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let opened = Arc::new(AtomicBool::new(false));

        let task = LinkTask {
            url: url.to_string(),
            conn,
            events,
            outgoing: rx,
            cancel: cancel.clone(),
            opened: Arc::clone(&opened),
            heartbeat: self.config.heartbeat_interval,
        };
        drop(tokio::spawn(task.run()));

        Box::new(WsLink { conn, tx, cancel, opened })
    }
}

struct WsLink {
    conn: ConnectionId,
    tx: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
    opened: Arc<AtomicBool>,
}

impl TransportLink for WsLink {
    fn send(&self, frame: String) -> bool {
        match self.tx.try_send(Outgoing::Text(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = self.conn.0, "send queue full, refusing frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self, code: u16, reason: &str) {
        if !self.opened.load(Ordering::Acquire) {
            self.cancel.cancel();
            return;
        }
        let close = Outgoing::Close {
            code,
            reason: reason.to_string(),
        };
        if self.tx.try_send(close).is_err() {
            self.cancel.cancel();
        }
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        if !self.opened.load(Ordering::Acquire) {
            self.cancel.cancel();
        }
    }
}

struct LinkTask {
    url: String,
    conn: ConnectionId,
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
    opened: Arc<AtomicBool>,
    heartbeat: Duration,
}

impl LinkTask {
    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            conn: self.conn,
            kind,
        });
    }

    async fn run(mut self) {
        let target = match Url::parse(&self.url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => url,
            Ok(url) => {
                self.emit(TransportEventKind::Errored(format!(
                    "unsupported scheme '{}'",
                    url.scheme()
                )));
                return;
            }
            Err(e) => {
                self.emit(TransportEventKind::Errored(format!("invalid url: {e}")));
                return;
            }
        };
        debug!(conn = self.conn.0, url = %redacted(&target), "opening websocket");

        let handshake = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.emit(TransportEventKind::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "connection attempt cancelled".into(),
                    was_clean: false,
                });
                return;
            }
            result = connect_async(target.as_str()) => result,
        };

        let ws = match handshake {
            Ok((ws, _response)) => ws,
            Err(e) => {
                self.emit(TransportEventKind::Errored(e.to_string()));
                return;
            }
        };

        self.opened.store(true, Ordering::Release);
        self.emit(TransportEventKind::Opened);

        let (mut sink, mut stream) = ws.split();
        let mut ping = tokio::time::interval(self.heartbeat);
        ping.tick().await;

        let terminal = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    break TransportEventKind::Closed {
                        code: 1000,
                        reason: "closed by client".into(),
                        was_clean: true,
                    };
                }
                out = self.outgoing.recv() => match out {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            break TransportEventKind::Errored(e.to_string());
                        }
                    }
                    Some(Outgoing::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break TransportEventKind::Closed { code, reason, was_clean: true };
                    }
                    None => {
                        let _ = sink.close().await;
                        break TransportEventKind::Closed {
                            code: 1000,
                            reason: "link dropped".into(),
                            was_clean: true,
                        };
                    }
                },
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        break TransportEventKind::Errored(e.to_string());
                    }
                    trace!(conn = self.conn.0, "sent ping");
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.emit(TransportEventKind::Received(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                            .unwrap_or((1005, String::new()));
                        break TransportEventKind::Closed {
                            was_clean: CloseCause::from_code(code).is_clean(),
                            code,
                            reason,
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportEventKind::Errored(e.to_string()),
                    None => {
                        break TransportEventKind::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: String::new(),
                            was_clean: false,
                        };
                    }
                },
            }
        };

        debug!(conn = self.conn.0, event = ?terminal, "websocket link ended");
        self.emit(terminal);
    }
}

/// Strip credentials and query parameters before logging a URL.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    let _ = shown.set_username("");
    let _ = shown.set_password(None);
    shown.set_query(None);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_drops_secrets() {
        let url = Url::parse("wss://user:pw@api.example.com/ws?token=abc").unwrap();
        assert_eq!(redacted(&url), "wss://api.example.com/ws");
    }

    #[tokio::test]
    async fn rejects_non_websocket_scheme() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _link = WsTransport::default().open("http://localhost/ws", ConnectionId(1), tx);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.conn, ConnectionId(1));
        assert!(matches!(event.kind, TransportEventKind::Errored(ref m) if m.contains("scheme")));
    }

    #[tokio::test]
    async fn unreachable_host_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _link = WsTransport::default().open("ws://127.0.0.1:1/ws", ConnectionId(7), tx);
        let event = rx.recv().await.unwrap();
        assert!(event.kind.is_terminal());
        assert!(rx.recv().await.is_none());
    }
}
