//! Server record of recently used connect tokens

use std::net::SocketAddr;

use crate::crypto::{ct_eq, MAC_BYTES};

#[derive(Debug, Clone)]
struct TokenEntry {
    mac: [u8; MAC_BYTES],
    address: Option<SocketAddr>,
    time: f64,
}

impl Default for TokenEntry {
    fn default() -> Self {
        Self {
            mac: [0; MAC_BYTES],
            address: None,
            time: -1000.0,
        }
    }
}

/// Fixed array of `(mac, endpoint, time)` scanned linearly.
///
/// A token is accepted the first time it is seen and afterwards only from
/// the endpoint that first used it.
#[derive(Debug)]
pub struct TokenHistory {
    entries: Vec<TokenEntry>,
}

impl TokenHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![TokenEntry::default(); capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Returns false when `mac` was already used from a different endpoint.
    /// An unseen mac evicts the oldest entry.
    pub fn find_or_add(&mut self, mac: &[u8; MAC_BYTES], address: SocketAddr, now: f64) -> bool {
        let mut oldest = 0;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.address.is_some() && ct_eq(&entry.mac, mac) {
                return entry.address == Some(address);
            }
            if entry.time < self.entries[oldest].time {
                oldest = index;
            }
        }

        self.entries[oldest] = TokenEntry {
            mac: *mac,
            address: Some(address),
            time: now,
        };
        true
    }

    pub fn reset(&mut self) {
        self.entries.fill(TokenEntry::default());
    }
}
