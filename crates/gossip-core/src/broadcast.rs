//! Queue of pending gossip broadcasts.
//!
//! Messages are queued pre-encoded and handed out once to the outbound
//! pipeline for piggybacking. When the queue is full the oldest entry is
//! dropped.

use crate::delegate::BroadcastSource;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Maximum number of pending broadcasts before oldest are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// FIFO of encoded broadcasts waiting for a carrier datagram.
pub struct TransmitQueue {
    queue: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Queue an encoded message for dissemination.
    pub fn push(&self, msg: Vec<u8>) {
        let mut queue = self.queue.lock();
        // Drop oldest if queue is full (FIFO eviction)
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(msg);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for TransmitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastSource for TransmitQueue {
    fn take_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut queue = self.queue.lock();
        let mut used = 0;
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());

        // Messages that do not fit stay queued for a later carrier
        for msg in queue.drain(..) {
            let cost = msg.len() + overhead;
            if used + cost <= limit {
                used += cost;
                taken.push(msg);
            } else {
                kept.push_back(msg);
            }
        }
        *queue = kept;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_in_order_within_limit() {
        let queue = TransmitQueue::new();
        queue.push(vec![1; 10]);
        queue.push(vec![2; 10]);
        queue.push(vec![3; 10]);

        let taken = queue.take_broadcasts(2, 24);
        assert_eq!(taken, vec![vec![1; 10], vec![2; 10]]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_skips_oversized_but_takes_later_fit() {
        let queue = TransmitQueue::new();
        queue.push(vec![1; 50]);
        queue.push(vec![2; 5]);

        let taken = queue.take_broadcasts(2, 20);
        assert_eq!(taken, vec![vec![2; 5]]);

        // The large message is still there for a roomier datagram
        let taken = queue.take_broadcasts(2, 100);
        assert_eq!(taken, vec![vec![1; 50]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_limit_takes_nothing() {
        let queue = TransmitQueue::new();
        queue.push(vec![1]);
        assert!(queue.take_broadcasts(2, 0).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let queue = TransmitQueue::with_capacity(2);
        queue.push(vec![1]);
        queue.push(vec![2]);
        queue.push(vec![3]);

        let taken = queue.take_broadcasts(0, 100);
        assert_eq!(taken, vec![vec![2], vec![3]]);
    }
}
