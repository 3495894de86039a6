//! Bounded lock-free queue between a receive task and the tick loop

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use tracing::trace;

/// One inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub payload: Bytes,
}

/// Fixed-capacity MPMC queue; pushes beyond capacity are dropped and counted.
#[derive(Debug)]
pub struct DatagramQueue {
    queue: ArrayQueue<Datagram>,
    dropped: AtomicU64,
}

impl DatagramQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false if the queue was full and the datagram dropped
    pub fn push(&self, from: SocketAddr, payload: Bytes) -> bool {
        match self.queue.push(Datagram { from, payload }) {
            Ok(()) => true,
            Err(datagram) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(from = %datagram.from, len = datagram.payload.len(), "datagram queue full, dropping");
                false
            }
        }
    }

    pub fn pop(&self) -> Option<Datagram> {
        self.queue.pop()
    }

    /// Pop at most the number of datagrams queued right now
    pub fn drain_available(&self) -> Vec<Datagram> {
        let available = self.queue.len();
        (0..available).map_while(|_| self.queue.pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}
