//! Media receive path
//!
//! ```text
//! TakionConnection ─▶ AvReceiver ─┬─▶ VideoPipeline: PacketQueue ─▶ decode ─▶ FramePool ─▶ render
//!                                 └─▶ AudioPipeline: PacketQueue ─▶ decode ─▶ FramePool ─▶ sink
//! ```

pub mod audio;
pub mod frame_pool;
pub mod monitor;
pub mod packet_queue;
pub mod receiver;
pub mod sink;
pub mod video;

use std::collections::VecDeque;
use std::time::Duration;

pub use audio::{AudioDecoder, AudioFormat, AudioFrame, AudioPipeline, AudioSink, AudioStats};
pub use frame_pool::{FramePool, ReadSlot, SlotState, WriteSlot};
pub use monitor::{PerformanceMonitor, PerformanceSample, PerformanceSnapshot};
pub use packet_queue::PacketQueue;
pub use receiver::{AvReceiver, PacketStats};
pub use sink::SampleRing;
#[cfg(feature = "cpal-sink")]
pub use sink::CpalAudioSink;
pub use video::{Picture, VideoDecoder, VideoFrame, VideoPipeline, VideoRenderer, VideoStats};

const DECODE_WINDOW: usize = 10;

/// Rolling average over the last few decode durations
#[derive(Debug, Default, Clone)]
pub struct DecodeTimeWindow {
    samples: VecDeque<f64>,
}

impl DecodeTimeWindow {
    pub fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == DECODE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    /// Mean in milliseconds, `0.0` before any sample
    pub fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_window_keeps_last_samples() {
        let mut window = DecodeTimeWindow::default();
        assert_eq!(window.average_ms(), 0.0);

        for _ in 0..DECODE_WINDOW {
            window.record(Duration::from_millis(100));
        }
        assert!((window.average_ms() - 100.0).abs() < 1e-6);

        for _ in 0..DECODE_WINDOW {
            window.record(Duration::from_millis(2));
        }
        assert!((window.average_ms() - 2.0).abs() < 1e-6);
    }
}
