//! Bounded packet queue for the decode pipelines
//!
//! Drop-oldest on overflow so a stalled decoder never blocks the network
//! worker.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Mutex-guarded FIFO of owned packets
pub struct PacketQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

struct Inner {
    packets: VecDeque<Bytes>,
    closed: bool,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                packets: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue, evicting the oldest packet when full.
    /// Returns `false` if a packet was dropped to make room.
    pub fn push(&self, packet: Bytes) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = if inner.packets.len() >= self.capacity {
                inner.packets.pop_front();
                true
            } else {
                false
            };
            inner.packets.push_back(packet);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        !evicted
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        self.inner.lock().packets.pop_front()
    }

    /// Wait up to `timeout` for a packet. `None` on timeout or once closed
    /// and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.packets.is_empty() && !inner.closed {
            self.ready.wait_for(&mut inner, timeout);
        }
        inner.packets.pop_front()
    }

    /// Wake all waiters; subsequent pops drain what is left
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }

    /// Re-open after `close`
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    /// Discard queued packets, returning how many
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.packets.len();
        inner.packets.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Packets evicted by overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity as f32
    }
}
