//! Presentation-facing facade over one connection and its chat pipeline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use vigil_client::{ConnectOutcome, ConnectionHandle, SendOutcome, Subscription};
use vigil_core::{ConnectionError, ConnectionStatus, IdentityBinder};

use crate::errors::ChatError;
use crate::messages::{ChatEvent, ChatMessage};
use crate::notices::recovery_for;
use crate::pipeline::PipelineHandle;

const QUEUED_KEY: &str = "queue_messages";
const RETRY_KEY: &str = "manual_retry_needed";
const RECONNECTING_KEY: &str = "reconnecting";

pub struct ChatSession {
    connection: ConnectionHandle,
    pipeline: PipelineHandle,
    binder: Arc<IdentityBinder>,
}

impl ChatSession {
    pub fn new(
        connection: ConnectionHandle,
        pipeline: PipelineHandle,
        binder: Arc<IdentityBinder>,
    ) -> Self {
        Self {
            connection,
            pipeline,
            binder,
        }
    }

    /// Publish the prompt as a user message, open a turn and send the
    /// request, queuing it when the connection is not open.
    pub async fn ask(&self, prompt: &str) -> Result<SendOutcome, ChatError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        if !self.pipeline.begin(ChatMessage::user(prompt)).await? {
            return Err(ChatError::TurnInFlight);
        }

        let request = self.binder.analysis_request(prompt);
        match self.connection.send(request).await {
            Ok(SendOutcome::Sent) => Ok(SendOutcome::Sent),
            Ok(SendOutcome::Queued { seq }) => {
                info!(seq, "request queued until the connection opens");
                self.pipeline.track_queued(seq)?;
                self.pipeline.notice(QUEUED_KEY)?;
                Ok(SendOutcome::Queued { seq })
            }
            Ok(SendOutcome::Failed) => {
                warn!("request rejected by the open link");
                self.pipeline.abort(RETRY_KEY)?;
                Ok(SendOutcome::Failed)
            }
            Err(err) => {
                warn!(error = %err, kind = err.error_kind(), "request could not be handed over");
                self.pipeline.abort(RETRY_KEY)?;
                Err(err.into())
            }
        }
    }

    /// Manual retry: tell the user, then reconnect with a fresh attempt count.
    pub async fn retry_connection(&self) -> Result<ConnectOutcome, ChatError> {
        self.pipeline.notice(RECONNECTING_KEY)?;
        let result = self.connection.reconnect().await;
        self.advise(result)
    }

    pub async fn connect(&self) -> Result<ConnectOutcome, ChatError> {
        let result = self.connection.connect().await;
        self.advise(result)
    }

    /// Publish recovery advice for a refused connect before handing the
    /// error back.
    fn advise(
        &self,
        result: Result<ConnectOutcome, ConnectionError>,
    ) -> Result<ConnectOutcome, ChatError> {
        result.map_err(|err| {
            let advice = recovery_for(&err);
            info!(error = %err, action = advice.action.as_str(), "connect refused");
            if let Err(e) = self.pipeline.publish(ChatMessage::recovery(&advice)) {
                warn!(error = %e, "recovery advice not delivered");
            }
            ChatError::Connection(err)
        })
    }

    pub async fn disconnect(&self) -> Result<(), ChatError> {
        Ok(self.connection.disconnect().await?)
    }

    /// Drop any pending turn.
    pub fn clear(&self) -> Result<(), ChatError> {
        self.pipeline.reset()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.pipeline.subscribe(callback)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    pub fn is_thinking(&self) -> bool {
        self.pipeline.is_pending()
    }

    pub fn binder(&self) -> &IdentityBinder {
        &self.binder
    }

    pub async fn shutdown(&self) {
        self.pipeline.shutdown();
        self.connection.shutdown().await;
    }
}
