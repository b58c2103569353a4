//! Audio decode pipeline
//!
//! Same shape as the video pipeline: packet queue, decode worker, frame pool,
//! playback feeder. Without a decoder the pipeline runs in silence
//! passthrough, emitting zeroed PCM per packet so playback timing holds.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AudioConfig;
use crate::error::{AudioError, Error, Result};
use crate::media::frame_pool::FramePool;
use crate::media::packet_queue::PacketQueue;
use crate::media::DecodeTimeWindow;
use crate::platform::Worker;

/// Deadline for joining decoder workers
pub const DECODER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const WORKER_POLL: Duration = Duration::from_millis(100);

/// Sample encoding of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    Opus,
    #[default]
    PcmS16Le,
    Unknown,
}

/// Decoded PCM held in a pool slot
#[derive(Debug, Clone, Default)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel
    pub sample_count: usize,
    /// Stream position in milliseconds
    pub timestamp: u64,
    pub format: AudioFormat,
    /// Interleaved samples; `sample_count * channels` are valid
    pub pcm: Vec<i16>,
    pub is_silence: bool,
}

impl AudioFrame {
    fn with_config(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            pcm: vec![0; config.frame_bytes() / 2],
            ..Self::default()
        }
    }

    /// Valid interleaved samples
    pub fn samples(&self) -> &[i16] {
        let len = (self.sample_count * self.channels as usize).min(self.pcm.len());
        &self.pcm[..len]
    }

    /// Size of the valid PCM in bytes
    pub fn byte_len(&self) -> usize {
        self.samples().len() * 2
    }
}

/// External audio decoder, typically Opus
pub trait AudioDecoder: Send {
    /// Decode one packet into `pcm`, returning samples per channel
    fn decode(&mut self, packet: &[u8], pcm: &mut [i16], frame_size: usize) -> Result<usize>;

    /// Fill `pcm` for a lost packet; decoders without concealment return silence
    fn conceal(&mut self, pcm: &mut [i16], frame_size: usize) -> Result<usize> {
        pcm.fill(0);
        Ok(frame_size)
    }

    fn format(&self) -> AudioFormat {
        AudioFormat::Opus
    }
}

/// PCM consumer
pub trait AudioSink: Send {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn play(&mut self, frame: &AudioFrame) -> Result<()>;
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioStats {
    pub packets_received: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub decode_errors: u64,
    pub silence_frames: u64,
    pub frames_played: u64,
    pub average_decode_time_ms: f64,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    frames_decoded: AtomicU64,
    pool_drops: AtomicU64,
    decode_errors: AtomicU64,
    silence_frames: AtomicU64,
    frames_played: AtomicU64,
}

struct Shared {
    config: AudioConfig,
    queue: PacketQueue,
    pool: FramePool<AudioFrame>,
    decoder: Mutex<Option<Box<dyn AudioDecoder>>>,
    sink: Mutex<Box<dyn AudioSink>>,
    running: AtomicBool,
    counters: Counters,
    decode_times: Mutex<DecodeTimeWindow>,
}

/// Audio decode and playback pipeline
pub struct AudioPipeline {
    shared: Arc<Shared>,
    workers: Mutex<Vec<Worker>>,
}

impl AudioPipeline {
    /// `decoder = None` selects silence passthrough
    pub fn new(config: AudioConfig, decoder: Option<Box<dyn AudioDecoder>>, sink: Box<dyn AudioSink>) -> Result<Self> {
        if !matches!(config.channels, 1 | 2) {
            return Err(AudioError::UnsupportedFormat(format!("{} channels", config.channels)).into());
        }
        if config.samples_per_frame() == 0 {
            return Err(Error::InvalidParam("audio frame duration yields no samples".into()));
        }
        if decoder.is_none() {
            tracing::warn!("No audio decoder available, using silence passthrough");
        }

        let pool_config = config.clone();
        Ok(Self {
            shared: Arc::new(Shared {
                queue: PacketQueue::new(config.queue_capacity),
                pool: FramePool::new(config.pool_size, || AudioFrame::with_config(&pool_config)),
                config,
                decoder: Mutex::new(decoder),
                sink: Mutex::new(sink),
                running: AtomicBool::new(false),
                counters: Counters::default(),
                decode_times: Mutex::new(DecodeTimeWindow::default()),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn is_silent_passthrough(&self) -> bool {
        self.shared.decoder.lock().is_none()
    }

    /// Start the sink, decode worker and playback feeder
    pub fn start(&self) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared
            .sink
            .lock()
            .start()
            .map_err(|e| AudioError::Sink(e.to_string()))?;

        self.shared.queue.reopen();
        self.shared.running.store(true, Ordering::SeqCst);

        let decode_shared = self.shared.clone();
        let playback_shared = self.shared.clone();
        let spawned = Worker::spawn("audio-decode", move || decode_shared.decode_loop()).and_then(|decode| {
            let playback = Worker::spawn("audio-playback", move || playback_shared.playback_loop())?;
            Ok(vec![decode, playback])
        });

        match spawned {
            Ok(workers) => {
                *self.workers.lock() = workers;
                tracing::debug!(
                    sample_rate = self.shared.config.sample_rate,
                    channels = self.shared.config.channels,
                    "Audio pipeline started"
                );
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(Error::Init(format!("audio worker: {e}")))
            }
        }
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.close();
        let mut all_joined = true;
        for mut worker in self.workers.lock().drain(..) {
            all_joined &= worker.join_timeout(DECODER_JOIN_TIMEOUT);
        }
        if all_joined {
            self.shared.sink.lock().stop();
        }
        self.shared.queue.flush();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Queue one packet for decoding
    pub fn submit(&self, packet: Bytes) -> Result<()> {
        if !self.is_running() {
            return Err(Error::InvalidState("audio decoder not running".into()));
        }
        self.shared.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.shared.queue.push(packet);
        Ok(())
    }

    pub fn stats(&self) -> AudioStats {
        let c = &self.shared.counters;
        AudioStats {
            packets_received: c.packets_received.load(Ordering::Relaxed),
            frames_decoded: c.frames_decoded.load(Ordering::Relaxed),
            frames_dropped: c.pool_drops.load(Ordering::Relaxed) + self.shared.queue.dropped(),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            silence_frames: c.silence_frames.load(Ordering::Relaxed),
            frames_played: c.frames_played.load(Ordering::Relaxed),
            average_decode_time_ms: self.shared.decode_times.lock().average_ms(),
        }
    }

    pub fn pool_available(&self) -> usize {
        self.shared.pool.available_count()
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn decode_loop(&self) {
        let frame_size = self.config.samples_per_frame();
        let frame_ms = self.config.frame_duration_ms as u64;
        let mut position_ms = 0u64;

        while self.running.load(Ordering::SeqCst) {
            let Some(packet) = self.queue.pop_timeout(WORKER_POLL) else {
                continue;
            };
            let Some(mut slot) = self.pool.acquire_write() else {
                self.counters.pool_drops.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let started = Instant::now();
            let result = match self.decoder.lock().as_mut() {
                Some(decoder) => match decoder.decode(&packet, &mut slot.pcm, frame_size) {
                    Ok(samples) => Ok((samples, decoder.format(), false)),
                    Err(e) => {
                        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Audio decode failed, concealing: {}", e);
                        decoder.conceal(&mut slot.pcm, frame_size).map(|n| (n, decoder.format(), false))
                    }
                },
                None => {
                    slot.pcm.fill(0);
                    Ok((frame_size, AudioFormat::PcmS16Le, true))
                }
            };

            let (samples, source_format, is_silence) = match result {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::debug!("Audio concealment failed: {}", e);
                    continue;
                }
            };
            self.decode_times.lock().record(started.elapsed());

            slot.sample_rate = self.config.sample_rate;
            slot.channels = self.config.channels;
            slot.sample_count = samples.min(frame_size);
            slot.timestamp = position_ms;
            slot.format = match source_format {
                AudioFormat::Unknown => AudioFormat::Unknown,
                _ => AudioFormat::PcmS16Le,
            };
            slot.is_silence = is_silence;
            slot.commit();

            position_ms += frame_ms;
            self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
            if is_silence {
                self.counters.silence_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn playback_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let Some(frame) = self.pool.acquire_read(WORKER_POLL) else {
                continue;
            };
            match self.sink.lock().play(&frame) {
                Ok(()) => {
                    self.counters.frames_played.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::debug!("Audio sink rejected frame: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Sender};

    struct ChannelSink {
        frames: Sender<AudioFrame>,
    }

    impl AudioSink for ChannelSink {
        fn play(&mut self, frame: &AudioFrame) -> Result<()> {
            let _ = self.frames.send(frame.clone());
            Ok(())
        }
    }

    /// Writes the first packet byte into every sample
    struct ConstDecoder;

    impl AudioDecoder for ConstDecoder {
        fn decode(&mut self, packet: &[u8], pcm: &mut [i16], frame_size: usize) -> Result<usize> {
            let value = *packet
                .first()
                .ok_or_else(|| AudioError::DecodingFailed("empty packet".into()))?;
            pcm.fill(value as i16);
            Ok(frame_size)
        }
    }

    #[test]
    fn test_frame_size() {
        let config = AudioConfig::default();
        assert_eq!(config.samples_per_frame(), 960);
        assert_eq!(config.frame_bytes(), 960 * 2 * 2);
    }

    #[test]
    fn test_silence_passthrough() {
        let (tx, rx) = unbounded();
        let audio = AudioPipeline::new(AudioConfig::default(), None, Box::new(ChannelSink { frames: tx })).unwrap();
        assert!(audio.is_silent_passthrough());
        audio.start().unwrap();

        audio.submit(Bytes::from_static(b"opus")).unwrap();
        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(frame.is_silence);
        assert_eq!(frame.sample_count, 960);
        assert_eq!(frame.byte_len(), 960 * 2 * 2);
        assert!(frame.samples().iter().all(|&s| s == 0));

        audio.stop();
        assert_eq!(audio.stats().silence_frames, 1);
    }

    #[test]
    fn test_decoded_frames_and_concealment() {
        let (tx, rx) = unbounded();
        let audio = AudioPipeline::new(
            AudioConfig::default(),
            Some(Box::new(ConstDecoder)),
            Box::new(ChannelSink { frames: tx }),
        )
        .unwrap();
        audio.start().unwrap();

        audio.submit(Bytes::from_static(&[7])).unwrap();
        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!frame.is_silence);
        assert_eq!(frame.format, AudioFormat::PcmS16Le);
        assert!(frame.samples().iter().all(|&s| s == 7));
        assert_eq!(frame.timestamp, 0);

        audio.submit(Bytes::new()).unwrap();
        let concealed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(concealed.samples().iter().all(|&s| s == 0));
        assert_eq!(concealed.timestamp, 20);

        audio.stop();
        assert_eq!(audio.stats().decode_errors, 1);
        assert_eq!(audio.pool_available(), AudioConfig::default().pool_size);
    }

    #[test]
    fn test_rejects_surround() {
        let (tx, _rx) = unbounded();
        let config = AudioConfig {
            channels: 6,
            ..AudioConfig::default()
        };
        assert!(AudioPipeline::new(config, None, Box::new(ChannelSink { frames: tx })).is_err());
    }
}
