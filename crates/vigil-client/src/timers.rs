use tokio::time::Instant;

/// Timers owned by the connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Handshake,
    Reconnect,
    CircuitCooldown,
    /// Grace period for a link the manager closed itself.
    CloseGrace,
}

const ALL: [TimerKind; 4] = [
    TimerKind::Handshake,
    TimerKind::Reconnect,
    TimerKind::CircuitCooldown,
    TimerKind::CloseGrace,
];

/// Explicit, cancellable deadlines: at most one pending deadline per kind.
///
/// Arming a kind replaces its previous deadline, so a stale timer can never
/// fire after being superseded.
#[derive(Debug, Default)]
pub struct TimerSet {
    handshake: Option<Instant>,
    reconnect: Option<Instant>,
    cooldown: Option<Instant>,
    close_grace: Option<Instant>,
}

impl TimerSet {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<Instant> {
        match kind {
            TimerKind::Handshake => &mut self.handshake,
            TimerKind::Reconnect => &mut self.reconnect,
            TimerKind::CircuitCooldown => &mut self.cooldown,
            TimerKind::CloseGrace => &mut self.close_grace,
        }
    }

    pub fn arm(&mut self, kind: TimerKind, deadline: Instant) {
        *self.slot(kind) = Some(deadline);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadline(kind).is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        match kind {
            TimerKind::Handshake => self.handshake,
            TimerKind::Reconnect => self.reconnect,
            TimerKind::CircuitCooldown => self.cooldown,
            TimerKind::CloseGrace => self.close_grace,
        }
    }

    /// Earliest armed deadline, if any.
    pub fn next_due(&self) -> Option<(TimerKind, Instant)> {
        ALL.iter()
            .filter_map(|kind| self.deadline(*kind).map(|at| (*kind, at)))
            .min_by_key(|(_, at)| *at)
    }

    /// Disarm and return every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(TimerKind, Instant)> = ALL
            .iter()
            .filter_map(|kind| self.deadline(*kind).map(|at| (*kind, at)))
            .filter(|(_, at)| *at <= now)
            .collect();
        due.sort_by_key(|(_, at)| *at);
        for (kind, _) in &due {
            self.cancel(*kind);
        }
        due.into_iter().map(|(kind, _)| kind).collect()
    }
}
