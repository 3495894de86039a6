//! Per-connection replay protection

use crate::packet::constants::{GLOBAL_SEQUENCE_BIT, REPLAY_PROTECTION_BUFFER_SIZE};

const EMPTY: u64 = u64::MAX;

/// Sliding window over the last `REPLAY_PROTECTION_BUFFER_SIZE` sequences.
///
/// Sequences with the global bit set come from outside a client stream
/// (challenges, denials) and are never tracked.
#[derive(Debug, Clone)]
pub struct ReplayProtection {
    most_recent_sequence: u64,
    received: Box<[u64; REPLAY_PROTECTION_BUFFER_SIZE]>,
}

impl Default for ReplayProtection {
    fn default() -> Self {
        Self {
            most_recent_sequence: 0,
            received: Box::new([EMPTY; REPLAY_PROTECTION_BUFFER_SIZE]),
        }
    }
}

impl ReplayProtection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.most_recent_sequence = 0;
        self.received.fill(EMPTY);
    }

    pub fn most_recent_sequence(&self) -> u64 {
        self.most_recent_sequence
    }

    /// True for duplicates and for sequences older than the window
    pub fn already_received(&self, sequence: u64) -> bool {
        if sequence & GLOBAL_SEQUENCE_BIT != 0 {
            return false;
        }
        if sequence + REPLAY_PROTECTION_BUFFER_SIZE as u64 <= self.most_recent_sequence {
            return true;
        }
        let stored = self.received[sequence as usize % REPLAY_PROTECTION_BUFFER_SIZE];
        stored != EMPTY && stored >= sequence
    }

    /// Record an authenticated sequence
    pub fn advance(&mut self, sequence: u64) {
        if sequence & GLOBAL_SEQUENCE_BIT != 0 {
            return;
        }
        if sequence > self.most_recent_sequence {
            self.most_recent_sequence = sequence;
        }
        self.received[sequence as usize % REPLAY_PROTECTION_BUFFER_SIZE] = sequence;
    }
}
