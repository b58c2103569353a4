//! End-to-end behaviours of the retry engine, settings blob and queues

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::cell::RefCell;
use std::time::{Duration, Instant};

use remote_play_core::config::{AudioConfig, QualityPreset, Resolution, Settings, Validation};
use remote_play_core::error::{Error, ErrorKind, NetworkError};
use remote_play_core::media::{AudioDecoder, AudioFrame, AudioPipeline, AudioSink, PacketQueue};
use remote_play_core::retry::{execute_with, BackoffStrategy, RetryClock, RetryPolicy};

struct RecordingClock {
    origin: Instant,
    elapsed: RefCell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl RetryClock for RecordingClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.borrow()
    }

    fn sleep(&self, duration: Duration) -> bool {
        *self.elapsed.borrow_mut() += duration;
        self.sleeps.borrow_mut().push(duration);
        true
    }
}

#[test]
fn test_retry_exponential_schedule() {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1_000),
        max_delay: Duration::from_millis(5_000),
        strategy: BackoffStrategy::Exponential,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
        ..RetryPolicy::default()
    };
    let clock = RecordingClock {
        origin: Instant::now(),
        elapsed: RefCell::new(Duration::ZERO),
        sleeps: RefCell::new(Vec::new()),
    };

    let mut attempts = 0;
    let result: Result<(), Error> = execute_with(&policy, &clock, |_| {
        attempts += 1;
        Err(NetworkError::ConnectionFailed("no route".into()).into())
    });

    assert_eq!(attempts, 3);
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Network);
    assert_eq!(
        *clock.sleeps.borrow(),
        vec![Duration::from_millis(1_000), Duration::from_millis(2_000)]
    );
}

#[test]
fn test_settings_blob_round_trip() {
    let defaults = Settings::default();
    assert_eq!(defaults.quality, QualityPreset::Balanced);
    assert_eq!(defaults.resolution, Resolution { width: 720, height: 480 });
    assert_eq!(defaults.fps, 60);
    assert_eq!(defaults.bitrate_kbps, 8_000);
    assert_eq!(defaults.mtu, 1_500);
    assert_eq!(defaults.deadzone, 15.0);
    assert_eq!(defaults.sensitivity, 85.0);

    let blob = defaults.to_bytes().unwrap();
    let loaded = Settings::from_bytes(&blob).unwrap();
    assert_eq!(loaded, defaults);
    assert_eq!(loaded.validate(), Validation::Valid);

    let json = defaults.to_json().unwrap();
    assert_eq!(Settings::from_json(&json).unwrap(), defaults);
}

#[test]
fn test_settings_bitrate_bounds() {
    let at = |bitrate_kbps| Settings {
        bitrate_kbps,
        ..Settings::default()
    };
    assert!(at(1_000).validate().is_valid());
    assert!(!at(999).validate().is_valid());
    assert!(at(15_000).validate().is_valid());
    assert!(!at(15_001).validate().is_valid());
}

#[test]
fn test_bounded_audio_queue() {
    let queue = PacketQueue::new(32);
    for i in 0..64u8 {
        queue.push(Bytes::from(vec![i; 8]));
        assert!(queue.len() <= 32);
    }
    assert_eq!(queue.len(), 32);
    assert_eq!(queue.dropped(), 32);

    // Oldest packets went first
    assert_eq!(queue.try_pop().unwrap()[0], 32);
}

/// Holds each decode until the test releases it
struct GatedDecoder {
    entered: Sender<()>,
    gate: Receiver<()>,
}

impl AudioDecoder for GatedDecoder {
    fn decode(&mut self, _packet: &[u8], pcm: &mut [i16], frame_size: usize) -> remote_play_core::Result<usize> {
        let _ = self.entered.send(());
        let _ = self.gate.recv();
        pcm.fill(0);
        Ok(frame_size)
    }
}

struct NullSink;

impl AudioSink for NullSink {
    fn play(&mut self, _frame: &AudioFrame) -> remote_play_core::Result<()> {
        Ok(())
    }
}

#[test]
fn test_stalled_audio_decoder_counts_dropped_frames() {
    let (entered_tx, entered_rx) = bounded(16);
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let config = AudioConfig {
        queue_capacity: 4,
        ..AudioConfig::default()
    };
    let decoder = GatedDecoder {
        entered: entered_tx,
        gate: gate_rx,
    };
    let pipeline = AudioPipeline::new(config, Some(Box::new(decoder)), Box::new(NullSink)).unwrap();
    pipeline.start().unwrap();

    // The decode worker takes the first packet and stalls on it
    pipeline.submit(Bytes::from_static(&[1])).unwrap();
    entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    for i in 0..10u8 {
        pipeline.submit(Bytes::from(vec![i; 4])).unwrap();
    }
    let stats = pipeline.stats();
    assert_eq!(stats.packets_received, 11);
    assert_eq!(stats.frames_dropped, 6);
    assert_eq!(stats.frames_decoded, 0);

    drop(gate_tx);
    pipeline.stop();
    assert!(pipeline.stats().frames_dropped >= 6);
}
