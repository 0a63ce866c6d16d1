//! The connection manager actor.
//!
//! One task owns the transport link, the state machine, every timer and the
//! outbound queue. Callers talk to it through a cloneable
//! [`ConnectionHandle`]; all state changes happen inside the actor loop, so
//! nothing here needs a lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn, Instrument};
use vigil_core::{
    ConnectionError, ConnectionEvent, ConnectionId, ConnectionState, ConnectionStatus, Envelope,
    IdentityBinder,
};

use crate::dispatcher::{Dispatcher, Subscription};
use crate::machine::{ConnectionMachine, FailureOutcome, Rejection};
use crate::policy::ReconnectPolicy;
use crate::queue::OutboundQueue;
use crate::timers::{TimerKind, TimerSet};
use crate::transport::{Transport, TransportEvent, TransportEventKind, TransportLink};
use crate::ws::WsConfig;

const COMMAND_BUFFER: usize = 64;
const NORMAL_CLOSURE: u16 = 1000;

/// Configuration for the connection manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub url: String,
    pub policy: ReconnectPolicy,
    /// Bound on the `Connecting` state.
    pub handshake_timeout: Duration,
    /// How long a link the manager closed itself may take to confirm.
    pub close_grace: Duration,
    /// Inbound envelopes kept for inspection.
    pub history_capacity: usize,
    pub send_queue_capacity: usize,
    pub heartbeat_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".into(),
            policy: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(2),
            history_capacity: 50,
            send_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    pub fn ws_config(&self) -> WsConfig {
        WsConfig {
            send_queue_capacity: self.send_queue_capacity,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new transport attempt was started.
    Started,
    /// An attempt is already in flight, or the current link is still
    /// shutting down and a reconnect will follow.
    AlreadyConnecting,
    AlreadyOpen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the open link.
    Sent,
    /// Held for delivery once a connection opens. `seq` identifies the
    /// entry for [`ConnectionHandle::cancel_queued`].
    Queued { seq: u64 },
    /// The open link refused the frame; the link is being torn down.
    Failed,
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Sent | Self::Queued { .. })
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect(Reply<Result<ConnectOutcome, ConnectionError>>),
    Reconnect(Reply<Result<ConnectOutcome, ConnectionError>>),
    Disconnect(Reply<()>),
    Send(Envelope, Reply<SendOutcome>),
    CancelQueued(u64, Reply<bool>),
    Status(Reply<ConnectionStatus>),
    Shutdown,
}

/// Cloneable front end to a running connection manager.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    inbound: Dispatcher<Envelope>,
    events: Dispatcher<ConnectionEvent>,
}

impl ConnectionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?;
        rx.await.map_err(|_| ConnectionError::ManagerStopped)
    }

    /// Start a connection attempt. Rejected immediately while the circuit
    /// breaker is open.
    pub async fn connect(&self) -> Result<ConnectOutcome, ConnectionError> {
        self.request(Command::Connect).await?
    }

    /// Manual disconnect followed by a connect. The attempt counter resets;
    /// an open circuit still blocks the connect.
    pub async fn reconnect(&self) -> Result<ConnectOutcome, ConnectionError> {
        self.request(Command::Reconnect).await?
    }

    /// Close the link and suppress auto-reconnect.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.request(Command::Disconnect).await
    }

    /// Send now if open, otherwise queue and make sure a connection is on
    /// its way.
    pub async fn send(&self, envelope: Envelope) -> Result<SendOutcome, ConnectionError> {
        self.request(|reply| Command::Send(envelope, reply)).await
    }

    /// Withdraw a queued envelope. Returns `false` once it has been handed
    /// to a link.
    pub async fn cancel_queued(&self, seq: u64) -> Result<bool, ConnectionError> {
        self.request(|reply| Command::CancelQueued(seq, reply)).await
    }

    /// Last published status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Status as of every event the actor has already received.
    pub async fn current_status(&self) -> Result<ConnectionStatus, ConnectionError> {
        self.request(Command::Status).await
    }

    /// Receive every decoded inbound envelope.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inbound.subscribe(callback)
    }

    /// Receive connection lifecycle events.
    pub fn subscribe_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Recently received envelopes, oldest first.
    pub fn recent(&self) -> Vec<Envelope> {
        self.inbound.recent()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

struct ActiveLink {
    conn: ConnectionId,
    link: Box<dyn TransportLink>,
    opened: bool,
    /// Set when the manager tore the link down itself.
    closing_reason: Option<String>,
}

/// Actor owning the single transport link.
pub struct ConnectionManager {
    config: ManagerConfig,
    transport: Box<dyn Transport>,
    binder: Option<Arc<IdentityBinder>>,
    machine: ConnectionMachine,
    timers: TimerSet,
    queue: OutboundQueue,
    link: Option<ActiveLink>,
    last_conn: ConnectionId,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    inbound: Dispatcher<Envelope>,
    notices: Dispatcher<ConnectionEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    last_error: Option<String>,
    authenticated: bool,
}

impl ConnectionManager {
    /// Spawn the actor. With a binder, every successful open is followed by
    /// an `authenticate` frame before any queued envelope.
    pub fn spawn(
        config: ManagerConfig,
        transport: impl Transport,
        binder: Option<Arc<IdentityBinder>>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let initial = ConnectionStatus {
            max_attempts: config.policy.max_attempts,
            ..Default::default()
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let inbound = Dispatcher::new(config.history_capacity);
        let notices = Dispatcher::new(config.history_capacity);

        let token = binder
            .as_ref()
            .map(|b| b.client_token().to_string())
            .unwrap_or_default();
        let span = tracing::info_span!("connection_manager", client_token = %token);

        let manager = Self {
            machine: ConnectionMachine::new(config.policy.clone()),
            config,
            transport: Box::new(transport),
            binder,
            timers: TimerSet::default(),
            queue: OutboundQueue::default(),
            link: None,
            last_conn: ConnectionId(0),
            events_tx,
            events_rx,
            commands: cmd_rx,
            inbound: inbound.clone(),
            notices: notices.clone(),
            status_tx,
            last_error: None,
            authenticated: false,
        };

        let task = tokio::spawn(manager.run().instrument(span));
        let handle = ConnectionHandle {
            commands: cmd_tx,
            status: status_rx,
            inbound,
            events: notices,
        };
        (handle, task)
    }

    async fn run(mut self) {
        loop {
            let next = self.timers.next_due();
            let deadline = next.map_or_else(Instant::now, |(_, at)| at);

            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => self.on_transport_event(event).await,
                _ = sleep_until(deadline), if next.is_some() => self.on_timers(),
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
            }
        }

        self.timers = TimerSet::default();
        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!(dropped, "discarding queued envelopes on shutdown");
        }
        if let Some(active) = self.link.take() {
            active.link.close(NORMAL_CLOSURE, "client shutdown");
        }
        self.machine.on_manual_disconnect();
        self.publish_status();
        info!("connection manager stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Command::Reconnect(reply) => {
                self.disconnect();
                let _ = reply.send(self.connect());
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Send(envelope, reply) => {
                let _ = reply.send(self.send(envelope));
            }
            Command::CancelQueued(seq, reply) => {
                let withdrawn = self.queue.remove(seq).is_some();
                if withdrawn {
                    debug!(seq, queued = self.queue.len(), "withdrew queued envelope");
                    self.publish_status();
                }
                let _ = reply.send(withdrawn);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self) -> Result<ConnectOutcome, ConnectionError> {
        match self.machine.request_connect(Instant::now()) {
            Ok(()) => {
                self.timers.cancel(TimerKind::Reconnect);
                self.open_link();
                Ok(ConnectOutcome::Started)
            }
            Err(Rejection::CircuitOpen { attempts, retry_in }) => {
                let err = ConnectionError::CircuitOpen { attempts, retry_in };
                info!(attempts, retry_in_ms = retry_in.as_millis() as u64, "connect rejected: circuit open");
                self.publish_event(ConnectionEvent::ConnectRejected {
                    reason: err.to_string(),
                });
                Err(err)
            }
            Err(Rejection::AlreadyActive(ConnectionState::Open)) => Ok(ConnectOutcome::AlreadyOpen),
            Err(Rejection::AlreadyActive(_)) => Ok(ConnectOutcome::AlreadyConnecting),
        }
    }

    fn disconnect(&mut self) {
        self.timers.cancel(TimerKind::Reconnect);
        self.timers.cancel(TimerKind::Handshake);
        self.timers.cancel(TimerKind::CloseGrace);
        if let Some(active) = self.link.take() {
            info!(conn = active.conn.0, "disconnecting");
            active.link.close(NORMAL_CLOSURE, "client disconnect");
        }
        self.machine.on_manual_disconnect();
        self.authenticated = false;
        self.publish_event(ConnectionEvent::Disconnected);
        self.publish_status();
    }

    fn send(&mut self, envelope: Envelope) -> SendOutcome {
        if self.machine.state() == ConnectionState::Open {
            if self.transmit(&envelope) {
                return SendOutcome::Sent;
            }
            warn!(kind = envelope.kind(), "send failed on open link");
            self.tear_down("send failed");
            return SendOutcome::Failed;
        }

        let seq = self.queue.push(envelope);
        debug!(seq, queued = self.queue.len(), "queued envelope until connected");

        // A pending reconnect or an open circuit already determines when the
        // next attempt happens.
        let idle = self.machine.state() == ConnectionState::Idle;
        if idle && !self.machine.circuit_open() && !self.timers.is_armed(TimerKind::Reconnect) {
            let _ = self.connect();
        }
        self.publish_status();
        SendOutcome::Queued { seq }
    }

    fn open_link(&mut self) {
        if let Some(old) = self.link.take() {
            debug!(conn = old.conn.0, "closing superseded link");
            old.link.close(NORMAL_CLOSURE, "superseded");
        }

        let conn = self.last_conn.next();
        self.last_conn = conn;
        let attempt = self.machine.attempts() + 1;
        info!(conn = conn.0, attempt, "connecting");

        let link = self
            .transport
            .open(&self.config.url, conn, self.events_tx.clone());
        self.link = Some(ActiveLink {
            conn,
            link,
            opened: false,
            closing_reason: None,
        });
        self.timers.arm(
            TimerKind::Handshake,
            Instant::now() + self.config.handshake_timeout,
        );
        self.publish_event(ConnectionEvent::Connecting { attempt });
        self.publish_status();
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let current = self.link.as_ref().map(|l| l.conn);
        if current != Some(event.conn) {
            trace!(conn = event.conn.0, "ignoring event from stale link");
            return;
        }

        match event.kind {
            TransportEventKind::Opened => self.on_opened().await,
            TransportEventKind::Received(frame) => self.on_frame(event.conn, &frame),
            TransportEventKind::Closed { code, reason, was_clean } => {
                self.on_link_lost(LinkLoss::Closed { code, reason, was_clean });
            }
            TransportEventKind::Errored(message) => self.on_link_lost(LinkLoss::Errored(message)),
        }
    }

    async fn on_opened(&mut self) {
        if self.machine.state() != ConnectionState::Connecting {
            return;
        }
        self.timers.cancel(TimerKind::Handshake);
        self.timers.cancel(TimerKind::Reconnect);

        let after_retry = self.machine.on_opened();
        let conn = match self.link.as_mut() {
            Some(active) => {
                active.opened = true;
                active.conn
            }
            None => return,
        };
        self.last_error = None;
        self.authenticated = false;
        info!(conn = conn.0, after_retry, "connection open");
        self.publish_event(ConnectionEvent::Opened { after_retry });

        if let Some(binder) = self.binder.clone() {
            match binder.authenticate_frame().await {
                Ok(frame) => {
                    if !self.transmit(&frame) {
                        self.tear_down("authenticate frame rejected");
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "identity lookup failed, continuing unauthenticated"),
            }
        }

        self.flush_queue();
        self.publish_status();
    }

    fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Some(active) = self.link.as_ref() else {
            return;
        };
        let report = self.queue.drain_with(|envelope| match envelope.encode() {
            Ok(frame) => active.link.send(frame),
            Err(e) => {
                warn!(error = %e, kind = envelope.kind(), "dropping unencodable envelope");
                true
            }
        });

        if report.completed() {
            info!(conn = active.conn.0, sent = report.sent, "flushed outbound queue");
        } else {
            warn!(
                conn = active.conn.0,
                sent = report.sent,
                remaining = report.remaining,
                "send failed during queue flush"
            );
            self.tear_down("send failed during queue flush");
        }
    }

    fn on_frame(&mut self, conn: ConnectionId, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn = conn.0, error = %e, frame_len = frame.len(), "dropping malformed frame");
                return;
            }
        };

        match &envelope {
            Envelope::AuthSuccess { .. } => {
                self.authenticated = true;
                self.publish_event(ConnectionEvent::AuthAccepted);
                self.publish_status();
            }
            Envelope::AuthError { error, .. } => {
                warn!(conn = conn.0, error = %error, "authentication rejected");
                self.authenticated = false;
                self.publish_event(ConnectionEvent::AuthRejected {
                    error: error.clone(),
                });
                self.publish_status();
            }
            _ => {}
        }

        self.inbound.dispatch(&envelope);
    }

    /// Close a link the manager can no longer use and wait for the
    /// transport to confirm; the loss is then handled like any other.
    fn tear_down(&mut self, reason: &str) {
        let Some(active) = self.link.as_mut() else {
            return;
        };
        if active.closing_reason.is_some() {
            return;
        }
        active.closing_reason = Some(reason.to_string());
        self.machine.begin_closing();
        self.timers
            .arm(TimerKind::CloseGrace, Instant::now() + self.config.close_grace);
        active.link.close(NORMAL_CLOSURE, reason);
        self.publish_status();
    }

    fn on_link_lost(&mut self, loss: LinkLoss) {
        let Some(active) = self.link.take() else {
            return;
        };
        self.timers.cancel(TimerKind::Handshake);
        self.timers.cancel(TimerKind::CloseGrace);
        self.authenticated = false;
        let was_open = active.opened;

        let error = match loss {
            LinkLoss::Closed { code, reason, was_clean } => {
                let error = ConnectionError::from_close(code, &reason);
                self.publish_event(ConnectionEvent::Closed {
                    code,
                    reason,
                    was_clean,
                    was_open,
                });
                error
            }
            LinkLoss::Errored(message) => {
                self.publish_event(ConnectionEvent::Errored {
                    message: message.clone(),
                    was_open,
                });
                ConnectionError::Network(message)
            }
            LinkLoss::GraceExpired => ConnectionError::SendFailed("link did not confirm close".into()),
        };

        let error = match active.closing_reason {
            Some(reason) => ConnectionError::SendFailed(reason),
            None => error,
        };
        warn!(
            conn = active.conn.0,
            was_open,
            retryable = error.is_retryable(),
            error_kind = error.error_kind(),
            error = %error,
            "connection lost"
        );
        self.handle_failure(error);
    }

    fn handle_failure(&mut self, error: ConnectionError) {
        let now = Instant::now();
        self.last_error = Some(error.to_string());

        match self.machine.on_failure(now) {
            FailureOutcome::Retry { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                self.timers.arm(TimerKind::Reconnect, now + delay);
                self.publish_event(ConnectionEvent::ReconnectScheduled { attempt, delay });
            }
            FailureOutcome::CircuitOpened { attempts, reopen_at } => {
                let cooldown = reopen_at.saturating_duration_since(now);
                warn!(
                    attempts,
                    cooldown_secs = cooldown.as_secs(),
                    "circuit breaker opened after {} consecutive failures",
                    attempts
                );
                self.timers.cancel(TimerKind::Reconnect);
                self.timers.arm(TimerKind::CircuitCooldown, reopen_at);
                self.last_error = Some(ConnectionError::Exhausted(attempts).to_string());
                self.publish_event(ConnectionEvent::CircuitOpened { attempts, cooldown });
            }
        }
        self.publish_status();
    }

    fn on_timers(&mut self) {
        for kind in self.timers.take_due(Instant::now()) {
            match kind {
                TimerKind::Handshake => self.on_handshake_timeout(),
                TimerKind::Reconnect => {
                    debug!("reconnect timer fired");
                    if let Err(e) = self.connect() {
                        debug!(error = %e, "scheduled reconnect not started");
                    }
                }
                TimerKind::CircuitCooldown => {
                    self.machine.on_cooldown_elapsed();
                    info!("circuit breaker closed after cool-down");
                    self.publish_event(ConnectionEvent::CircuitClosed);
                    if !self.queue.is_empty() && self.machine.state() == ConnectionState::Idle {
                        let _ = self.connect();
                    }
                    self.publish_status();
                }
                TimerKind::CloseGrace => self.on_link_lost(LinkLoss::GraceExpired),
            }
        }
    }

    fn on_handshake_timeout(&mut self) {
        let Some(active) = self.link.take() else {
            return;
        };
        if active.opened {
            self.link = Some(active);
            return;
        }
        let after = self.config.handshake_timeout;
        warn!(conn = active.conn.0, after_ms = after.as_millis() as u64, "handshake timed out");
        active.link.close(NORMAL_CLOSURE, "handshake timeout");
        self.publish_event(ConnectionEvent::HandshakeTimedOut { after });
        self.handle_failure(ConnectionError::HandshakeTimeout(after));
    }

    fn transmit(&self, envelope: &Envelope) -> bool {
        let Some(active) = self.link.as_ref() else {
            return false;
        };
        match envelope.encode() {
            Ok(frame) => active.link.send(frame),
            Err(e) => {
                warn!(error = %e, kind = envelope.kind(), "failed to encode envelope");
                false
            }
        }
    }

    fn snapshot(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.machine.state(),
            attempts: self.machine.attempts(),
            max_attempts: self.machine.policy().max_attempts,
            circuit_open: self.machine.circuit_open(),
            last_error: self.last_error.clone(),
            authenticated: self.authenticated,
            queued: self.queue.len(),
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn publish_event(&self, event: ConnectionEvent) {
        debug!(event = event.event_type(), "connection event");
        self.notices.dispatch(&event);
    }
}

enum LinkLoss {
    Closed { code: u16, reason: String, was_clean: bool },
    Errored(String),
    GraceExpired,
}
