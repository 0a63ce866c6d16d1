use std::collections::VecDeque;

use vigil_core::Envelope;

/// An envelope waiting for a usable connection.
#[derive(Clone, Debug)]
pub struct QueuedEnvelope {
    pub seq: u64,
    pub envelope: Envelope,
}

/// FIFO of envelopes submitted while no connection was open.
///
/// Entries leave in submission order, each at most once.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedEnvelope>,
    next_seq: u64,
}

/// Result of a drain attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    /// Entries still queued; non-zero means a send failed mid-drain.
    pub remaining: usize,
}

impl DrainReport {
    pub fn completed(&self) -> bool {
        self.remaining == 0
    }
}

impl OutboundQueue {
    pub fn push(&mut self, envelope: Envelope) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(QueuedEnvelope { seq, envelope });
        seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Send entries in order through `send`. An entry is removed only once
    /// `send` accepts it; the first refusal stops the drain and leaves that
    /// entry and everything after it queued.
    pub fn drain_with<F>(&mut self, mut send: F) -> DrainReport
    where
        F: FnMut(&Envelope) -> bool,
    {
        let mut sent = 0;
        while let Some(front) = self.entries.front() {
            if !send(&front.envelope) {
                break;
            }
            self.entries.pop_front();
            sent += 1;
        }
        DrainReport {
            sent,
            remaining: self.entries.len(),
        }
    }

    /// Withdraw one entry that has not been sent yet.
    pub fn remove(&mut self, seq: u64) -> Option<Envelope> {
        let index = self.entries.iter().position(|e| e.seq == seq)?;
        self.entries.remove(index).map(|e| e.envelope)
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
