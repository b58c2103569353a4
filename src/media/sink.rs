//! Host audio output
//!
//! [`SampleRing`] decouples the playback feeder from the device callback.
//! With the `cpal-sink` feature, [`CpalAudioSink`] drives the default output
//! device from a dedicated thread that owns the stream.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free interleaved sample buffer shared with the device callback
pub struct SampleRing {
    queue: ArrayQueue<i16>,
    overflows: AtomicU64,
    underruns: AtomicU64,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflows: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    /// Queue samples; those that do not fit are discarded. Returns how many were queued.
    pub fn push_samples(&self, samples: &[i16]) -> usize {
        let mut queued = 0;
        for &sample in samples {
            if self.queue.push(sample).is_err() {
                self.overflows.fetch_add((samples.len() - queued) as u64, Ordering::Relaxed);
                break;
            }
            queued += 1;
        }
        queued
    }

    /// Fill `out`, padding with silence when the ring runs dry
    pub fn fill(&self, out: &mut [i16]) -> usize {
        let mut filled = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(sample) => {
                    *slot = sample;
                    filled += 1;
                }
                None => *slot = 0,
            }
        }
        if filled < out.len() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        filled
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    /// Samples discarded because the ring was full
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Device callbacks that found too few samples
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

#[cfg(feature = "cpal-sink")]
mod output {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::SampleRing;
    use crate::error::{AudioError, Result};
    use crate::media::audio::{AudioFrame, AudioSink};
    use crate::platform::Worker;

    const OUTPUT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Plays PCM on the host's default output device
    pub struct CpalAudioSink {
        sample_rate: u32,
        channels: u16,
        ring: Arc<SampleRing>,
        running: Arc<AtomicBool>,
        worker: Option<Worker>,
    }

    impl CpalAudioSink {
        /// `buffer_ms` of interleaved audio is held between feeder and device
        pub fn new(sample_rate: u32, channels: u16, buffer_ms: u32) -> Self {
            let capacity = (sample_rate as usize * channels as usize * buffer_ms as usize) / 1000;
            Self {
                sample_rate,
                channels,
                ring: Arc::new(SampleRing::new(capacity)),
                running: Arc::new(AtomicBool::new(false)),
                worker: None,
            }
        }

        pub fn ring(&self) -> &Arc<SampleRing> {
            &self.ring
        }
    }

    impl AudioSink for CpalAudioSink {
        fn start(&mut self) -> Result<()> {
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let host = cpal::default_host();
            let device = match host.default_output_device() {
                Some(device) => device,
                None => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(AudioError::Sink("no default output device".into()).into());
                }
            };
            let config = StreamConfig {
                channels: self.channels,
                sample_rate: cpal::SampleRate(self.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let ring = self.ring.clone();
            let running = self.running.clone();
            // The stream stays on the thread that built it
            let worker = Worker::spawn("audio-output", move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        ring.fill(data);
                    },
                    |err| tracing::error!("Output stream error: {}", err),
                    None,
                );
                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start output stream: {}", e);
                            return;
                        }
                        while running.load(Ordering::Relaxed) {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => tracing::error!("Failed to build output stream: {}", e),
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::Sink(e.to_string())
            })?;
            self.worker = Some(worker);
            tracing::info!(rate = self.sample_rate, channels = self.channels, "Audio output started");
            Ok(())
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(mut worker) = self.worker.take() {
                worker.join_timeout(OUTPUT_JOIN_TIMEOUT);
            }
            self.ring.clear();
        }

        fn play(&mut self, frame: &AudioFrame) -> Result<()> {
            if frame.channels != self.channels {
                return Err(AudioError::UnsupportedFormat(format!("{} channels", frame.channels)).into());
            }
            self.ring.push_samples(frame.samples());
            Ok(())
        }
    }

    impl Drop for CpalAudioSink {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(feature = "cpal-sink")]
pub use output::CpalAudioSink;
