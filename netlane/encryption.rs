//! Server-side table of per-endpoint session keys

use std::net::SocketAddr;

use crate::crypto::Key;

/// Keys and lifetime for one remote endpoint
#[derive(Debug, Clone)]
pub struct EncryptionMapping {
    pub address: SocketAddr,
    pub send_key: Key,
    pub receive_key: Key,
    pub create_time: f64,
    pub last_access_time: f64,
    /// Absolute expiry; negative never expires
    pub expire_time: f64,
    /// Negative disables the inactivity timeout
    pub timeout_seconds: i32,
    pub client_index: Option<usize>,
}

impl EncryptionMapping {
    pub fn is_valid(&self, now: f64) -> bool {
        let alive = self.timeout_seconds < 0 || self.last_access_time + self.timeout_seconds as f64 >= now;
        let unexpired = self.expire_time < 0.0 || self.expire_time >= now;
        alive && unexpired
    }
}

/// Fixed arena of mappings, at most one per endpoint
#[derive(Debug)]
pub struct EncryptionManager {
    mappings: Vec<Option<EncryptionMapping>>,
}

impl EncryptionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            mappings: vec![None; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.mappings.len()
    }

    pub fn len(&self) -> usize {
        self.mappings.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install keys for `address`, replacing any mapping it already has.
    /// Returns false when every slot holds a live mapping.
    pub fn add(
        &mut self,
        address: SocketAddr,
        send_key: Key,
        receive_key: Key,
        now: f64,
        expire_time: f64,
        timeout_seconds: i32,
    ) -> bool {
        let index = self
            .position(address)
            .or_else(|| self.mappings.iter().position(|slot| slot.is_none()))
            .or_else(|| {
                self.mappings
                    .iter()
                    .position(|slot| slot.as_ref().is_some_and(|m| m.client_index.is_none() && !m.is_valid(now)))
            });
        let Some(index) = index else {
            return false;
        };
        self.mappings[index] = Some(EncryptionMapping {
            address,
            send_key,
            receive_key,
            create_time: now,
            last_access_time: now,
            expire_time,
            timeout_seconds,
            client_index: None,
        });
        true
    }

    /// Mapping for `address` that is still valid at `now`
    pub fn find(&self, address: SocketAddr, now: f64) -> Option<&EncryptionMapping> {
        self.position(address)
            .and_then(|index| self.mappings[index].as_ref())
            .filter(|mapping| mapping.is_valid(now))
    }

    /// Refresh on an authenticated receipt
    pub fn touch(&mut self, address: SocketAddr, now: f64) -> bool {
        let Some(mapping) = self.slot_mut(address) else {
            return false;
        };
        mapping.last_access_time = now;
        mapping.expire_time = if mapping.timeout_seconds >= 0 {
            now + mapping.timeout_seconds as f64
        } else {
            -1.0
        };
        true
    }

    pub fn set_client_index(&mut self, address: SocketAddr, client_index: Option<usize>) -> bool {
        match self.slot_mut(address) {
            Some(mapping) => {
                mapping.client_index = client_index;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, address: SocketAddr) -> bool {
        match self.position(address) {
            Some(index) => {
                self.mappings[index] = None;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.mappings.iter_mut().for_each(|slot| *slot = None);
    }

    fn position(&self, address: SocketAddr) -> Option<usize> {
        self.mappings
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|m| m.address == address))
    }

    fn slot_mut(&mut self, address: SocketAddr) -> Option<&mut EncryptionMapping> {
        let index = self.position(address)?;
        self.mappings[index].as_mut()
    }
}
