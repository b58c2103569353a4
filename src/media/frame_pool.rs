//! Fixed pool of pre-allocated frame slots
//!
//! The decoder takes free slots through [`FramePool::acquire_write`], the
//! renderer or sink takes committed ones through [`FramePool::acquire_read`].
//! Slot state is tracked under one mutex so a slot is never held by a writer
//! and a reader at once; frames themselves live behind per-slot mutexes and
//! are never reallocated.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::platform::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Writing,
    Ready,
    Reading,
}

struct Indices {
    states: Vec<SlotState>,
    write_index: usize,
    read_index: usize,
    available_count: usize,
}

/// Pool of `N` frames
pub struct FramePool<F> {
    slots: Vec<Mutex<F>>,
    indices: Mutex<Indices>,
    ready: Semaphore,
}

impl<F> FramePool<F> {
    /// Allocate `size` frames up front
    pub fn new(size: usize, mut make: impl FnMut() -> F) -> Self {
        let size = size.max(1);
        Self {
            slots: (0..size).map(|_| Mutex::new(make())).collect(),
            indices: Mutex::new(Indices {
                states: vec![SlotState::Free; size],
                write_index: 0,
                read_index: 0,
                available_count: size,
            }),
            ready: Semaphore::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Free slots
    pub fn available_count(&self) -> usize {
        self.indices.lock().available_count
    }

    /// Committed slots waiting for a reader
    pub fn ready_count(&self) -> usize {
        self.ready.available()
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.indices.lock().states.get(index).copied()
    }

    /// Claim a free slot for writing, or `None` if all are busy
    pub fn acquire_write(&self) -> Option<WriteSlot<'_, F>> {
        let index = {
            let mut indices = self.indices.lock();
            let n = indices.states.len();
            let start = indices.write_index;
            let index = (0..n)
                .map(|offset| (start + offset) % n)
                .find(|&i| indices.states[i] == SlotState::Free)?;
            indices.states[index] = SlotState::Writing;
            indices.available_count -= 1;
            indices.write_index = (index + 1) % n;
            index
        };
        Some(WriteSlot {
            pool: self,
            index,
            frame: self.slots[index].lock(),
            committed: false,
        })
    }

    /// Wait up to `timeout` for a committed slot
    pub fn acquire_read(&self, timeout: Duration) -> Option<ReadSlot<'_, F>> {
        if !self.ready.wait_timeout(timeout) {
            return None;
        }
        let index = {
            let mut indices = self.indices.lock();
            let n = indices.states.len();
            let start = indices.read_index;
            let index = (0..n)
                .map(|offset| (start + offset) % n)
                .find(|&i| indices.states[i] == SlotState::Ready)?;
            indices.states[index] = SlotState::Reading;
            indices.read_index = (index + 1) % n;
            index
        };
        Some(ReadSlot {
            pool: self,
            index,
            frame: self.slots[index].lock(),
        })
    }

    fn finish_write(&self, index: usize, committed: bool) {
        let mut indices = self.indices.lock();
        if committed {
            indices.states[index] = SlotState::Ready;
            drop(indices);
            self.ready.post();
        } else {
            indices.states[index] = SlotState::Free;
            indices.available_count += 1;
        }
    }

    fn finish_read(&self, index: usize) {
        let mut indices = self.indices.lock();
        indices.states[index] = SlotState::Free;
        indices.available_count += 1;
    }
}

/// Slot held by the writer; dropped without `commit` it returns to the pool
pub struct WriteSlot<'a, F> {
    pool: &'a FramePool<F>,
    index: usize,
    frame: MutexGuard<'a, F>,
    committed: bool,
}

impl<F> WriteSlot<'_, F> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hand the filled slot to readers
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl<F> Deref for WriteSlot<'_, F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.frame
    }
}

impl<F> DerefMut for WriteSlot<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        &mut self.frame
    }
}

impl<F> Drop for WriteSlot<'_, F> {
    fn drop(&mut self) {
        self.pool.finish_write(self.index, self.committed);
    }
}

/// Slot held by the reader; returned to the pool on drop
pub struct ReadSlot<'a, F> {
    pool: &'a FramePool<F>,
    index: usize,
    frame: MutexGuard<'a, F>,
}

impl<F> ReadSlot<'_, F> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<F> Deref for ReadSlot<'_, F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.frame
    }
}

impl<F> Drop for ReadSlot<'_, F> {
    fn drop(&mut self) {
        self.pool.finish_read(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_release() {
        let pool = FramePool::new(3, Vec::<u8>::new);
        let a = pool.acquire_write().unwrap();
        let b = pool.acquire_write().unwrap();
        let c = pool.acquire_write().unwrap();
        assert_eq!(pool.available_count(), 0);
        assert!(pool.acquire_write().is_none());

        drop(b);
        assert_eq!(pool.available_count(), 1);
        a.commit();
        c.commit();
        assert_eq!(pool.ready_count(), 2);
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn test_write_then_read_in_order() {
        let pool = FramePool::new(3, Vec::<u8>::new);
        for value in 1..=2u8 {
            let mut slot = pool.acquire_write().unwrap();
            slot.clear();
            slot.push(value);
            slot.commit();
        }

        let first = pool.acquire_read(Duration::from_millis(10)).unwrap();
        assert_eq!(first[0], 1);
        assert_eq!(pool.state(first.index()), Some(SlotState::Reading));
        drop(first);
        let second = pool.acquire_read(Duration::from_millis(10)).unwrap();
        assert_eq!(second[0], 2);
        drop(second);

        assert!(pool.acquire_read(Duration::from_millis(10)).is_none());
        assert_eq!(pool.available_count(), 3);
    }

    #[test]
    fn test_available_count_bounded_under_threads() {
        use std::sync::Arc;

        let pool = Arc::new(FramePool::new(3, || 0u32));
        let writer_pool = pool.clone();
        let writer = std::thread::spawn(move || {
            let mut written = 0;
            while written < 200 {
                if let Some(mut slot) = writer_pool.acquire_write() {
                    *slot = written;
                    slot.commit();
                    written += 1;
                }
                assert!(writer_pool.available_count() <= 3);
            }
        });

        let mut read = 0;
        while read < 200 {
            if let Some(slot) = pool.acquire_read(Duration::from_millis(100)) {
                assert_eq!(*slot, read);
                read += 1;
            }
            assert!(pool.available_count() <= 3);
        }
        writer.join().unwrap();
        assert_eq!(pool.available_count(), 3);
    }
}
