//! The chat pipeline actor.
//!
//! Subscribes to a connection's inbound envelopes and lifecycle events,
//! runs them through the [`TurnTracker`] and the notice table, and fans the
//! resulting [`ChatEvent`]s out to its own subscribers. The turn deadline is
//! owned here and raced against incoming input. A request still waiting in
//! the connection's outbound queue when its turn ends is withdrawn so the
//! server never sees it.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use vigil_client::{ConnectionHandle, Dispatcher, Subscription};
use vigil_core::{ConnectionEvent, Envelope};

use crate::errors::ChatError;
use crate::messages::{ChatEvent, ChatMessage};
use crate::notices::notice_for;
use crate::turn::TurnTracker;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// How long a turn may stay pending without a terminal envelope.
    pub turn_timeout: Duration,
    /// Chat events kept for inspection.
    pub history_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(30),
            history_capacity: 50,
        }
    }
}

enum Input {
    Envelope(Envelope),
    Connection(ConnectionEvent),
    /// Emit the user's message and open a turn, unless one is pending.
    Ask {
        message: ChatMessage,
        reply: oneshot::Sender<bool>,
    },
    /// The current turn's request was queued under this sequence number.
    Track(u64),
    Abort(String),
    Notice(String),
    Publish(ChatMessage),
    Reset,
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable front end to a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    inputs: mpsc::UnboundedSender<Input>,
    pending: watch::Receiver<bool>,
    output: Dispatcher<ChatEvent>,
}

impl PipelineHandle {
    fn push(&self, input: Input) -> Result<(), ChatError> {
        self.inputs
            .send(input)
            .map_err(|_| ChatError::PipelineStopped)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.output.subscribe(callback)
    }

    /// Publish the user's message and open a turn. Returns `false` without
    /// emitting anything when a turn is already pending.
    pub async fn begin(&self, message: ChatMessage) -> Result<bool, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.push(Input::Ask { message, reply })?;
        rx.await.map_err(|_| ChatError::PipelineStopped)
    }

    /// End the pending turn locally with an error message for `key`.
    pub fn abort(&self, key: &str) -> Result<(), ChatError> {
        self.push(Input::Abort(key.to_string()))
    }

    /// Remember that the pending turn's request sits in the outbound queue.
    pub fn track_queued(&self, seq: u64) -> Result<(), ChatError> {
        self.push(Input::Track(seq))
    }

    pub fn notice(&self, key: &str) -> Result<(), ChatError> {
        self.push(Input::Notice(key.to_string()))
    }

    pub fn publish(&self, message: ChatMessage) -> Result<(), ChatError> {
        self.push(Input::Publish(message))
    }

    pub fn reset(&self) -> Result<(), ChatError> {
        self.push(Input::Reset)
    }

    /// Resolves once every input sent before it has been processed.
    pub async fn flush(&self) -> Result<(), ChatError> {
        let (tx, rx) = oneshot::channel();
        self.push(Input::Flush(tx))?;
        rx.await.map_err(|_| ChatError::PipelineStopped)
    }

    pub fn is_pending(&self) -> bool {
        *self.pending.borrow()
    }

    pub fn recent(&self) -> Vec<ChatEvent> {
        self.output.recent()
    }

    pub fn shutdown(&self) {
        let _ = self.inputs.send(Input::Shutdown);
    }
}

pub struct ChatPipeline {
    tracker: TurnTracker,
    connection: ConnectionHandle,
    /// Queue entry holding the current turn's request, if it was not sent.
    queued: Option<u64>,
    /// Last connection notice, so a flapping link does not repeat itself.
    last_notice: Option<&'static str>,
    inputs: mpsc::UnboundedReceiver<Input>,
    output: Dispatcher<ChatEvent>,
    pending_tx: watch::Sender<bool>,
    subscriptions: Vec<Subscription>,
}

impl ChatPipeline {
    pub fn spawn(
        config: PipelineConfig,
        connection: &ConnectionHandle,
    ) -> (PipelineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = watch::channel(false);
        let output = Dispatcher::new(config.history_capacity);

        let envelopes = {
            let tx = tx.clone();
            connection.subscribe(move |env| {
                let _ = tx.send(Input::Envelope(env.clone()));
            })
        };
        let events = {
            let tx = tx.clone();
            connection.subscribe_events(move |event| {
                let _ = tx.send(Input::Connection(event.clone()));
            })
        };

        let pipeline = Self {
            tracker: TurnTracker::new(config.turn_timeout),
            connection: connection.clone(),
            queued: None,
            last_notice: None,
            inputs: rx,
            output: output.clone(),
            pending_tx,
            subscriptions: vec![envelopes, events],
        };
        let task = tokio::spawn(pipeline.run());

        let handle = PipelineHandle {
            inputs: tx,
            pending: pending_rx,
            output,
        };
        (handle, task)
    }

    async fn run(mut self) {
        loop {
            let deadline = self.tracker.deadline();

            tokio::select! {
                biased;
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let events = self.tracker.on_deadline();
                    self.emit(events);
                    self.withdraw().await;
                }
                input = self.inputs.recv() => match input {
                    Some(Input::Shutdown) | None => break,
                    Some(input) => self.on_input(input).await,
                },
            }
        }

        for sub in self.subscriptions.drain(..) {
            sub.unsubscribe();
        }
        info!("chat pipeline stopped");
    }

    async fn on_input(&mut self, input: Input) {
        let now = Instant::now();
        match input {
            Input::Envelope(envelope) => {
                let events = self.tracker.on_envelope(&envelope, now);
                self.emit(events);
                if !self.tracker.is_pending() {
                    // A timeout applied on arrival leaves the request to withdraw.
                    self.withdraw().await;
                }
            }
            Input::Connection(event) => self.on_connection_event(&event),
            Input::Ask { message, reply } => {
                if self.tracker.is_pending() {
                    let _ = reply.send(false);
                    return;
                }
                self.queued = None;
                let mut events = vec![ChatEvent::Message(message)];
                events.extend(self.tracker.begin(now));
                self.emit(events);
                let _ = reply.send(true);
            }
            Input::Track(seq) => {
                self.queued = Some(seq);
                if !self.tracker.is_pending() {
                    self.withdraw().await;
                }
            }
            Input::Abort(key) => {
                let events = self.tracker.abort(&key);
                self.emit(events);
                self.withdraw().await;
            }
            Input::Notice(key) => {
                self.emit(vec![ChatEvent::Message(ChatMessage::notice(&key))]);
            }
            Input::Publish(message) => self.emit(vec![ChatEvent::Message(message)]),
            Input::Reset => {
                let events = self.tracker.reset();
                self.emit(events);
                self.withdraw().await;
            }
            Input::Flush(reply) => {
                let _ = reply.send(());
            }
            Input::Shutdown => {}
        }
    }

    fn on_connection_event(&mut self, event: &ConnectionEvent) {
        if matches!(event, ConnectionEvent::Opened { .. } | ConnectionEvent::Disconnected) {
            self.last_notice = None;
        }
        let Some(key) = notice_for(event) else {
            return;
        };
        if self.last_notice == Some(key) {
            debug!(event = event.event_type(), notice = key, "repeated connection notice suppressed");
            return;
        }
        debug!(event = event.event_type(), notice = key, "connection notice");
        self.last_notice = Some(key);
        self.emit(vec![ChatEvent::Message(ChatMessage::notice(key))]);
    }

    /// Pull the finished turn's request out of the outbound queue.
    async fn withdraw(&mut self) {
        let Some(seq) = self.queued.take() else {
            return;
        };
        match self.connection.cancel_queued(seq).await {
            Ok(true) => debug!(seq, "queued request withdrawn"),
            Ok(false) => debug!(seq, "request already sent; late frames will be dropped"),
            Err(err) => warn!(seq, error = %err, "could not withdraw queued request"),
        }
    }

    fn emit(&self, events: Vec<ChatEvent>) {
        self.pending_tx.send_replace(self.tracker.is_pending());
        for event in &events {
            self.output.dispatch(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use vigil_client::mock::MockTransport;
    use vigil_client::{ConnectionManager, ManagerConfig};

    fn record(handle: &PipelineHandle) -> (Arc<Mutex<Vec<ChatEvent>>>, Subscription) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let sub = handle.subscribe(move |e| sink.lock().push(e.clone()));
        (log, sub)
    }

    async fn setup() -> (MockTransport, ConnectionHandle, PipelineHandle) {
        let transport = MockTransport::accepting();
        let config = ManagerConfig {
            url: "ws://mock/ws".into(),
            ..Default::default()
        };
        let (connection, _task) = ConnectionManager::spawn(config, transport.clone(), None);
        let (pipeline, _task) = ChatPipeline::spawn(PipelineConfig::default(), &connection);
        connection.connect().await.unwrap();
        connection.current_status().await.unwrap();
        (transport, connection, pipeline)
    }

    /// Let the manager process everything pushed so far, then the pipeline.
    async fn settle(connection: &ConnectionHandle, pipeline: &PipelineHandle) {
        connection.current_status().await.unwrap();
        pipeline.flush().await.unwrap();
    }

    fn push(transport: &MockTransport, frame: &str) {
        assert!(transport.push_raw(frame));
    }

    #[tokio::test(start_paused = true)]
    async fn server_started_turn_runs_to_completion() {
        let (transport, connection, pipeline) = setup().await;
        let (log, _sub) = record(&pipeline);

        push(&transport, r#"{"type":"analysis_start"}"#);
        push(&transport, r#"{"type":"log","level":"info","message":"✅ AI analysis complete"}"#);
        settle(&connection, &pipeline).await;
        assert!(pipeline.is_pending());

        push(
            &transport,
            r#"{"type":"analysis_complete","result":{"ai_response":"All clear."}}"#,
        );
        settle(&connection, &pipeline).await;
        assert!(!pipeline.is_pending());

        let events = log.lock().clone();
        let steps: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Thinking { step, .. } => Some(step.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec!["Starting analysis...", "Finalizing response..."]);
        assert!(matches!(events[events.len() - 2], ChatEvent::ThinkingCleared { .. }));
        assert_eq!(events.last().and_then(ChatEvent::message).unwrap().content, "All clear.");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_once_and_late_result_is_dropped() {
        let (transport, connection, pipeline) = setup().await;
        let (log, _sub) = record(&pipeline);

        assert!(pipeline.begin(ChatMessage::user("scan")).await.unwrap());
        tokio::time::sleep(Duration::from_secs(31)).await;
        pipeline.flush().await.unwrap();
        assert!(!pipeline.is_pending());

        push(&transport, r#"{"type":"analysis_start"}"#);
        push(&transport, r#"{"type":"log","level":"info","message":"AI analysis complete"}"#);
        push(&transport, r#"{"type":"analysis_complete","result":{"ai_response":"late"}}"#);
        settle(&connection, &pipeline).await;
        assert!(!pipeline.is_pending());

        let events = log.lock().clone();
        let finals: Vec<&ChatMessage> = events
            .iter()
            .filter_map(ChatEvent::message)
            .filter(|m| m.role != crate::messages::Role::User)
            .collect();
        assert_eq!(finals.len(), 1);
        assert!(finals[0].is_error());
        assert!(finals[0].metadata.can_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn second_begin_while_pending_is_refused() {
        let (_transport, _connection, pipeline) = setup().await;
        let (log, _sub) = record(&pipeline);

        assert!(pipeline.begin(ChatMessage::user("one")).await.unwrap());
        assert!(!pipeline.begin(ChatMessage::user("two")).await.unwrap());
        pipeline.flush().await.unwrap();

        let users = log
            .lock()
            .iter()
            .filter_map(ChatEvent::message)
            .filter(|m| m.role == crate::messages::Role::User)
            .count();
        assert_eq!(users, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_events_become_notices() {
        let (transport, connection, pipeline) = setup().await;
        let (log, _sub) = record(&pipeline);

        transport.drop_connection(1011, "backend unhealthy");
        settle(&connection, &pipeline).await;

        let keys: Vec<String> = log
            .lock()
            .iter()
            .filter_map(ChatEvent::message)
            .filter_map(|m| m.metadata.event_type.clone())
            .collect();
        assert_eq!(keys, vec!["server_unavailable".to_string()]);
    }

    fn notice_keys(log: &Mutex<Vec<ChatEvent>>) -> Vec<String> {
        log.lock()
            .iter()
            .filter_map(ChatEvent::message)
            .filter(|m| m.metadata.is_connection_message)
            .filter_map(|m| m.metadata.event_type.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_on_open_link_is_announced() {
        let (transport, connection, pipeline) = setup().await;
        let (log, _sub) = record(&pipeline);

        assert!(transport.fail("reset by peer"));
        settle(&connection, &pipeline).await;

        assert_eq!(transport.live(), 0);
        assert_eq!(notice_keys(&log), vec!["connection_failed".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_attempts_do_not_repeat_the_same_notice() {
        let transport = MockTransport::refusing();
        let config = ManagerConfig {
            url: "ws://mock/ws".into(),
            ..Default::default()
        };
        let (connection, _task) = ConnectionManager::spawn(config, transport.clone(), None);
        let (pipeline, _task) = ChatPipeline::spawn(PipelineConfig::default(), &connection);
        let (log, _sub) = record(&pipeline);

        connection.connect().await.unwrap();
        settle(&connection, &pipeline).await;
        for delay in [1, 2, 4, 8] {
            tokio::time::advance(Duration::from_secs(delay)).await;
            settle(&connection, &pipeline).await;
        }
        assert_eq!(transport.opens(), 5);

        let keys = notice_keys(&log);
        assert_eq!(keys.first().map(String::as_str), Some("errored"));
        assert_eq!(keys.last().map(String::as_str), Some("circuit_breaker"));
        assert!(keys.windows(2).all(|w| w[0] != w[1]), "{keys:?}");
        let generic = log
            .lock()
            .iter()
            .filter_map(ChatEvent::message)
            .filter(|m| m.content == crate::notices::GENERIC_NOTICE)
            .count();
        assert!(generic >= 1 && generic < transport.opens(), "{keys:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn published_message_reaches_subscribers() {
        let (_transport, _connection, pipeline) = setup().await;
        let (log, _sub) = record(&pipeline);

        let advice = crate::notices::recovery_for(&vigil_core::ConnectionError::Network("down".into()));
        pipeline.publish(ChatMessage::recovery(&advice)).unwrap();
        pipeline.flush().await.unwrap();

        let events = log.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message().unwrap().content, advice.message);
        assert!(!pipeline.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_detaches_from_connection() {
        let (transport, connection, pipeline) = setup().await;
        let (log, _sub) = record(&pipeline);

        pipeline.shutdown();
        tokio::task::yield_now().await;
        push(&transport, r#"{"type":"analysis_start"}"#);
        connection.current_status().await.unwrap();

        assert!(log.lock().is_empty());
        assert!(matches!(pipeline.flush().await, Err(ChatError::PipelineStopped)));
    }
}
