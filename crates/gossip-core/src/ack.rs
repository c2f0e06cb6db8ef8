//! Ack handler registry and sequence numbers.
//!
//! A handler is registered against the sequence number of an outgoing
//! probe. It then settles exactly once: either it fires because a
//! matching ack arrived before its deadline, or it expires. Firing,
//! expiry and sweeping may race from different threads; the state
//! transition happens under the map's shard lock and the handler runs
//! after the lock is released.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// One-shot action run when a matching ack arrives.
pub type AckHandler = Box<dyn FnOnce() + Send + Sync + 'static>;

enum AckEntry {
    Pending {
        expires_at: Instant,
        handler: AckHandler,
    },
    Fired,
    Expired,
}

/// Concurrent map of outstanding ack handlers keyed by sequence number.
#[derive(Default)]
pub struct AckRegistry {
    handlers: DashMap<u32, AckEntry>,
}

impl AckRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` to run once when an ack for `seq_no` arrives within `timeout`.
    ///
    /// A previous registration for the same sequence number is replaced.
    pub fn register<F>(&self, seq_no: u32, handler: F, timeout: Duration)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.register_until(seq_no, handler, Instant::now() + timeout);
    }

    /// Register with an explicit deadline.
    pub fn register_until<F>(&self, seq_no: u32, handler: F, expires_at: Instant)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.handlers.insert(
            seq_no,
            AckEntry::Pending {
                expires_at,
                handler: Box::new(handler),
            },
        );
    }

    /// Fire the handler for `seq_no` if it is still pending.
    ///
    /// Returns true if a handler ran. Unknown, expired or already fired
    /// sequence numbers are a no-op.
    pub fn invoke(&self, seq_no: u32) -> bool {
        self.invoke_at(seq_no, Instant::now())
    }

    /// [`invoke`](Self::invoke) against an explicit clock.
    pub fn invoke_at(&self, seq_no: u32, now: Instant) -> bool {
        let Some(mut entry) = self.handlers.get_mut(&seq_no) else {
            return false;
        };
        let expired = match &*entry {
            AckEntry::Pending { expires_at, .. } => now >= *expires_at,
            AckEntry::Fired | AckEntry::Expired => return false,
        };
        let next = if expired {
            AckEntry::Expired
        } else {
            AckEntry::Fired
        };
        let previous = std::mem::replace(&mut *entry, next);
        drop(entry);

        match previous {
            AckEntry::Pending { handler, .. } if !expired => {
                handler();
                true
            }
            _ => false,
        }
    }

    /// Expire overdue handlers and release settled entries.
    ///
    /// Entries that fired or expired are kept for one sweep so a late
    /// duplicate ack still finds them settled, then dropped. Returns the
    /// number of handlers expired by this call.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) against an explicit clock.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut expired = 0;
        self.handlers.retain(|_, entry| {
            let overdue = match entry {
                AckEntry::Pending { expires_at, .. } => now >= *expires_at,
                AckEntry::Fired | AckEntry::Expired => return false,
            };
            if overdue {
                *entry = AckEntry::Expired;
                expired += 1;
            }
            true
        });
        expired
    }

    /// Number of handlers still waiting for an ack.
    pub fn pending_count(&self) -> usize {
        self.handlers
            .iter()
            .filter(|entry| matches!(entry.value(), AckEntry::Pending { .. }))
            .count()
    }

    /// Number of entries held, settled or not.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Process-wide probe sequence counter.
///
/// Wraps around at `u32::MAX`; uniqueness only matters within the window
/// of outstanding probes.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    counter: AtomicU32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `seq_no`.
    pub fn starting_at(seq_no: u32) -> Self {
        Self {
            counter: AtomicU32::new(seq_no),
        }
    }

    /// Allocate the next sequence number.
    pub fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}
