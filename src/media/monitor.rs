//! Periodic performance sampling

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::MonitorConfig;
use crate::error::{Error, NetworkError, Result};
use crate::platform::{StopPipe, Worker};

const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Cumulative counters read from the session at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceSample {
    pub bytes_received: u64,
    pub video_frames_decoded: u64,
    pub audio_frames_decoded: u64,
    pub frames_dropped: u64,
    pub keepalive_rtt_ms: Option<f64>,
}

/// Rates over one sampling interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub rx_kbps: f64,
    pub video_fps: f64,
    pub audio_fps: f64,
    /// Drops during the interval
    pub frames_dropped: u64,
    pub total_dropped: u64,
    pub keepalive_rtt_ms: Option<f64>,
}

impl PerformanceSnapshot {
    /// Rates between two samples taken `elapsed` apart
    pub fn between(prev: &PerformanceSample, cur: &PerformanceSample, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = |delta: u64| if secs > 0.0 { delta as f64 / secs } else { 0.0 };
        Self {
            rx_kbps: rate(cur.bytes_received.saturating_sub(prev.bytes_received)) * 8.0 / 1000.0,
            video_fps: rate(cur.video_frames_decoded.saturating_sub(prev.video_frames_decoded)),
            audio_fps: rate(cur.audio_frames_decoded.saturating_sub(prev.audio_frames_decoded)),
            frames_dropped: cur.frames_dropped.saturating_sub(prev.frames_dropped),
            total_dropped: cur.frames_dropped,
            keepalive_rtt_ms: cur.keepalive_rtt_ms,
        }
    }
}

type Sampler = Box<dyn Fn() -> PerformanceSample + Send + Sync>;

struct Shared {
    interval: Duration,
    sampler: Sampler,
    latest: Mutex<Option<PerformanceSnapshot>>,
    running: AtomicBool,
    stop: StopPipe,
}

/// Background sampler
pub struct PerformanceMonitor {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl PerformanceMonitor {
    pub fn new(config: &MonitorConfig, sampler: impl Fn() -> PerformanceSample + Send + Sync + 'static) -> Result<Self> {
        if config.interval_ms == 0 {
            return Err(Error::InvalidParam("monitor interval must be non-zero".into()));
        }
        let stop = StopPipe::new().map_err(|e| NetworkError::SocketSetup(format!("stop pipe: {e}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                interval: Duration::from_millis(config.interval_ms),
                sampler: Box::new(sampler),
                latest: Mutex::new(None),
                running: AtomicBool::new(false),
                stop,
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stop.reset();
        let shared = self.shared.clone();
        let worker = Worker::spawn("perf-monitor", move || shared.run()).map_err(|e| {
            self.shared.running.store(false, Ordering::SeqCst);
            Error::Init(format!("monitor worker: {e}"))
        })?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.stop.stop();
        if let Some(mut worker) = self.worker.lock().take() {
            worker.join_timeout(MONITOR_JOIN_TIMEOUT);
        }
    }

    /// Most recent interval, once one has elapsed
    pub fn latest(&self) -> Option<PerformanceSnapshot> {
        *self.shared.latest.lock()
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        let mut prev = (self.sampler)();
        let mut prev_at = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            if !self.stop.sleep(self.interval) {
                break;
            }
            let cur = (self.sampler)();
            let now = Instant::now();
            let snapshot = PerformanceSnapshot::between(&prev, &cur, now - prev_at);
            tracing::trace!(
                rx_kbps = snapshot.rx_kbps,
                video_fps = snapshot.video_fps,
                dropped = snapshot.frames_dropped,
                "Performance sample"
            );
            *self.latest.lock() = Some(snapshot);
            prev = cur;
            prev_at = now;
        }
    }
}
