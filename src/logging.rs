//! Structured logging setup
//!
//! Installs a `tracing` subscriber with an env filter and a stderr layer,
//! plus an optional file layer. File writes go through [`LockedSink`], whose
//! lock acquisition is bounded so a stalled writer never blocks a worker.

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ConfigError, Result};

/// Bound on waiting for the sink lock
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Mutex-guarded log destination with bounded acquisition
pub struct LockedSink<W> {
    inner: Arc<Mutex<W>>,
    dropped: Arc<AtomicU64>,
}

impl<W> Clone for LockedSink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<W: Write> LockedSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records discarded because the lock could not be taken in time
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared handle to the underlying writer
    pub fn inner(&self) -> Arc<Mutex<W>> {
        self.inner.clone()
    }

    /// Writer for records of a known level
    pub fn writer_for_level(&self, level: Level) -> SinkWriter<W> {
        SinkWriter {
            sink: self.clone(),
            level: Some(level),
        }
    }
}

/// Per-record writer handed out by [`LockedSink`]
pub struct SinkWriter<W> {
    sink: LockedSink<W>,
    level: Option<Level>,
}

impl<W: Write> Write for SinkWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink.inner.try_lock_for(LOCK_TIMEOUT) {
            Some(mut writer) => writer.write(buf),
            None => {
                if self.level == Some(Level::ERROR) {
                    io::stderr().write_all(buf)?;
                } else {
                    self.sink.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.inner.try_lock_for(LOCK_TIMEOUT) {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a, W: Write + 'a> MakeWriter<'a> for LockedSink<W> {
    type Writer = SinkWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sink: self.clone(),
            level: None,
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer_for_level(*meta.level())
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConfigError::InvalidValue {
            field: "logging.level",
            reason: e.to_string(),
        })?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi)
        .with_thread_names(true);

    let file_layer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| ConfigError::Write {
                    path: path.display().to_string(),
                    source,
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(LockedSink::new(file))
                    .with_ansi(false)
                    .with_thread_names(true),
            )
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("Logging initialized at level {}", config.level);
    }
    Ok(installed)
}

/// Convenience for hosts that only want a level
pub fn init_with_level(level: &str) -> Result<bool> {
    let config = LoggingConfig {
        level: level.to_string(),
        ..LoggingConfig::default()
    };
    init(&config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sink_writes_when_free() {
        let sink = LockedSink::new(Vec::<u8>::new());
        let mut writer = sink.writer_for_level(Level::INFO);
        writer.write_all(b"hello").unwrap();
        assert_eq!(sink.inner().lock().as_slice(), b"hello");
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_sink_mirrors_errors_when_contended() {
        let sink = LockedSink::new(Vec::<u8>::new());
        let held = sink.inner();
        let guard = held.lock();

        let writer_sink = sink.clone();
        let handle = thread::spawn(move || {
            let mut writer = writer_sink.writer_for_level(Level::ERROR);
            writer.write(b"mirrored").unwrap()
        });
        assert_eq!(handle.join().unwrap(), 8);
        drop(guard);
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_sink_drops_non_errors_when_contended() {
        let sink = LockedSink::new(Vec::<u8>::new());
        let held = sink.inner();
        let guard = held.lock();

        let writer_sink = sink.clone();
        let handle = thread::spawn(move || {
            let mut writer = writer_sink.writer_for_level(Level::INFO);
            writer.write(b"lost").unwrap()
        });
        assert_eq!(handle.join().unwrap(), 4);
        drop(guard);

        assert_eq!(sink.dropped(), 1);
        assert!(sink.inner().lock().is_empty());
    }
}
