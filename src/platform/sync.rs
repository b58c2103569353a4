//! Worker threads and counting semaphores

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A named worker thread that can be joined with a deadline.
///
/// A worker that does not finish in time is abandoned: its handle is
/// detached and whatever it owns is leaked rather than killed.
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    done_rx: Receiver<()>,
}

impl Worker {
    /// Spawn a named worker thread
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done_rx) = bounded::<()>(1);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            // Dropped on return or unwind, which disconnects `done_rx`
            let _done = done_tx;
            body();
        })?;

        Ok(Self {
            name,
            handle: Some(handle),
            done_rx,
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Join the thread, giving up after `timeout`.
    ///
    /// Returns `true` if the thread was joined.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    tracing::error!(worker = %self.name, "Worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not stop in time, abandoning it"
                );
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            tracing::debug!(worker = %self.name, "Detaching worker that was never joined");
        }
    }
}

/// Counting semaphore
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            permits: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Release one permit
    pub fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    /// Take a permit if one is immediately available
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, waiting at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() {
                break;
            }
        }
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, waiting as long as needed
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Wake every waiter without granting permits
    pub fn wake_all(&self) {
        let _permits = self.permits.lock();
        self.available.notify_all();
    }

    /// Current permit count
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}
