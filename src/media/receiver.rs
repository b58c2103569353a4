//! Routes transport payloads into the decode pipelines

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::media::audio::AudioPipeline;
use crate::media::video::VideoPipeline;
use crate::takion::DataKind;

/// Per-kind receive counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketStats {
    pub video_packets: u64,
    pub video_bytes: u64,
    pub audio_packets: u64,
    pub audio_bytes: u64,
    pub control_packets: u64,
    /// Payloads no running pipeline would take
    pub rejected: u64,
}

impl PacketStats {
    pub fn total_bytes(&self) -> u64 {
        self.video_bytes + self.audio_bytes
    }
}

#[derive(Default)]
struct Counters {
    video_packets: AtomicU64,
    video_bytes: AtomicU64,
    audio_packets: AtomicU64,
    audio_bytes: AtomicU64,
    control_packets: AtomicU64,
    rejected: AtomicU64,
}

/// A/V demultiplexer between the transport and the pipelines
pub struct AvReceiver {
    video: Option<Arc<VideoPipeline>>,
    audio: Option<Arc<AudioPipeline>>,
    counters: Counters,
}

impl AvReceiver {
    pub fn new(video: Option<Arc<VideoPipeline>>, audio: Option<Arc<AudioPipeline>>) -> Self {
        Self {
            video,
            audio,
            counters: Counters::default(),
        }
    }

    /// Deliver one payload. Returns `true` if a pipeline accepted it.
    pub fn handle(&self, kind: DataKind, payload: Bytes) -> bool {
        let len = payload.len() as u64;
        let c = &self.counters;
        let accepted = match kind {
            DataKind::Video => {
                c.video_packets.fetch_add(1, Ordering::Relaxed);
                c.video_bytes.fetch_add(len, Ordering::Relaxed);
                self.video.as_ref().is_some_and(|video| video.submit(payload).is_ok())
            }
            DataKind::Audio => {
                c.audio_packets.fetch_add(1, Ordering::Relaxed);
                c.audio_bytes.fetch_add(len, Ordering::Relaxed);
                self.audio.as_ref().is_some_and(|audio| audio.submit(payload).is_ok())
            }
            DataKind::Control => {
                c.control_packets.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        if !accepted {
            c.rejected.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    pub fn stats(&self) -> PacketStats {
        let c = &self.counters;
        PacketStats {
            video_packets: c.video_packets.load(Ordering::Relaxed),
            video_bytes: c.video_bytes.load(Ordering::Relaxed),
            audio_packets: c.audio_packets.load(Ordering::Relaxed),
            audio_bytes: c.audio_bytes.load(Ordering::Relaxed),
            control_packets: c.control_packets.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }
}
