use std::time::Duration;

use tokio::time::Instant;
use vigil_core::ConnectionState;

use crate::policy::ReconnectPolicy;

/// Why a connect request was refused without touching the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    CircuitOpen { attempts: u32, retry_in: Duration },
    AlreadyActive(ConnectionState),
}

/// What the manager should do after a failed or lost connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { attempt: u32, delay: Duration },
    CircuitOpened { attempts: u32, reopen_at: Instant },
}

/// Lifecycle state, attempt counter and circuit breaker for one connection.
///
/// Pure bookkeeping: no timers, no I/O. The manager feeds it transport
/// outcomes and acts on the decisions it returns.
#[derive(Debug)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    reopen_at: Option<Instant>,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            attempts: 0,
            reopen_at: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn circuit_open(&self) -> bool {
        self.reopen_at.is_some()
    }

    /// `Idle -> Connecting`, unless the circuit is open or a connection is
    /// already in flight.
    pub fn request_connect(&mut self, now: Instant) -> Result<(), Rejection> {
        if let Some(reopen_at) = self.reopen_at {
            return Err(Rejection::CircuitOpen {
                attempts: self.attempts,
                retry_in: reopen_at.saturating_duration_since(now),
            });
        }
        match self.state {
            ConnectionState::Idle => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            active => Err(Rejection::AlreadyActive(active)),
        }
    }

    /// `Connecting -> Open`. Returns true when this open followed at least
    /// one failure.
    pub fn on_opened(&mut self) -> bool {
        let after_retry = self.attempts > 0;
        self.state = ConnectionState::Open;
        self.attempts = 0;
        after_retry
    }

    /// `Connecting|Open|Closing -> Idle` after a network-caused loss.
    pub fn on_failure(&mut self, now: Instant) -> FailureOutcome {
        self.state = ConnectionState::Idle;
        self.attempts = self.attempts.saturating_add(1);

        if self.policy.exhausted(self.attempts) {
            let reopen_at = now + self.policy.cooldown;
            self.reopen_at = Some(reopen_at);
            FailureOutcome::CircuitOpened {
                attempts: self.attempts,
                reopen_at,
            }
        } else {
            FailureOutcome::Retry {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            }
        }
    }

    /// Caller-initiated disconnect. The circuit, if open, stays open.
    pub fn on_manual_disconnect(&mut self) {
        self.state = ConnectionState::Idle;
        self.attempts = 0;
    }

    /// Cool-down elapsed: clear the circuit and start counting afresh.
    pub fn on_cooldown_elapsed(&mut self) {
        self.reopen_at = None;
        self.attempts = 0;
    }

    /// The manager tore the live link down and awaits the transport's
    /// terminal event.
    pub fn begin_closing(&mut self) {
        self.state = ConnectionState::Closing;
    }
}
