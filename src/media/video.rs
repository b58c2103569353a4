//! Video decode pipeline
//!
//! ```text
//!  submit() ──► PacketQueue ──► decode worker ──► FramePool ──► render feeder ──► VideoRenderer
//!                 (drop-oldest)    VideoDecoder      (N slots)
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::VideoConfig;
use crate::error::{Error, Result, VideoError};
use crate::media::frame_pool::FramePool;
use crate::media::packet_queue::PacketQueue;
use crate::media::DecodeTimeWindow;
use crate::platform::{monotonic_ms, Worker};

/// Deadline for joining decoder workers
pub const DECODER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const WORKER_POLL: Duration = Duration::from_millis(100);

/// Picture borrowed from the decoder's own output buffer
#[derive(Debug, Clone, Copy)]
pub struct Picture<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Decoded frame held in a pool slot
#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic milliseconds when decoding finished
    pub timestamp: u64,
    pub sequence: u64,
}

impl VideoFrame {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            ..Self::default()
        }
    }
}

/// External H.264 decoder
pub trait VideoDecoder: Send {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    /// Feed one access unit; `None` when no picture came out
    fn decode(&mut self, packet: &[u8]) -> Result<Option<Picture<'_>>>;
}

/// External presenter
pub trait VideoRenderer: Send {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn present(&mut self, frame: &VideoFrame) -> Result<()>;
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VideoStats {
    pub packets_received: u64,
    pub frames_decoded: u64,
    /// Pool exhaustion plus queue overflow
    pub frames_dropped: u64,
    pub decode_errors: u64,
    pub frames_rendered: u64,
    pub render_errors: u64,
    pub average_decode_time_ms: f64,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    frames_decoded: AtomicU64,
    pool_drops: AtomicU64,
    decode_errors: AtomicU64,
    frames_rendered: AtomicU64,
    render_errors: AtomicU64,
}

struct Shared {
    config: VideoConfig,
    queue: PacketQueue,
    pool: FramePool<VideoFrame>,
    decoder: Mutex<Box<dyn VideoDecoder>>,
    renderer: Mutex<Box<dyn VideoRenderer>>,
    decoding: AtomicBool,
    rendering: AtomicBool,
    counters: Counters,
    decode_times: Mutex<DecodeTimeWindow>,
}

/// Video decode and render pipeline
pub struct VideoPipeline {
    shared: Arc<Shared>,
    decode_worker: Mutex<Option<Worker>>,
    render_worker: Mutex<Option<Worker>>,
}

impl VideoPipeline {
    pub fn new(config: VideoConfig, decoder: Box<dyn VideoDecoder>, renderer: Box<dyn VideoRenderer>) -> Self {
        let frame_bytes = config.max_frame_bytes;
        Self {
            shared: Arc::new(Shared {
                queue: PacketQueue::new(config.queue_capacity),
                pool: FramePool::new(config.pool_size, || VideoFrame::with_capacity(frame_bytes)),
                config,
                decoder: Mutex::new(decoder),
                renderer: Mutex::new(renderer),
                decoding: AtomicBool::new(false),
                rendering: AtomicBool::new(false),
                counters: Counters::default(),
                decode_times: Mutex::new(DecodeTimeWindow::default()),
            }),
            decode_worker: Mutex::new(None),
            render_worker: Mutex::new(None),
        }
    }

    /// Start the renderer and its feeder
    pub fn start_renderer(&self) -> Result<()> {
        if self.shared.rendering.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared
            .renderer
            .lock()
            .start()
            .map_err(|e| VideoError::Renderer(e.to_string()))?;

        self.shared.rendering.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        match Worker::spawn("video-render", move || shared.render_loop()) {
            Ok(worker) => {
                *self.render_worker.lock() = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.shared.rendering.store(false, Ordering::SeqCst);
                self.shared.renderer.lock().stop();
                Err(Error::Init(format!("video render worker: {e}")))
            }
        }
    }

    /// Start the decoder and its worker
    pub fn start_decoder(&self) -> Result<()> {
        if self.shared.decoding.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared
            .decoder
            .lock()
            .start()
            .map_err(|e| VideoError::Decoder(e.to_string()))?;

        self.shared.queue.reopen();
        self.shared.decoding.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        match Worker::spawn("video-decode", move || shared.decode_loop()) {
            Ok(worker) => {
                *self.decode_worker.lock() = Some(worker);
                tracing::debug!(pool = self.shared.pool.size(), "Video decoder started");
                Ok(())
            }
            Err(e) => {
                self.shared.decoding.store(false, Ordering::SeqCst);
                self.shared.decoder.lock().stop();
                Err(Error::Init(format!("video decode worker: {e}")))
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        self.start_renderer()?;
        if let Err(e) = self.start_decoder() {
            self.stop_renderer();
            return Err(e);
        }
        Ok(())
    }

    pub fn stop_decoder(&self) {
        if !self.shared.decoding.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.close();
        if let Some(mut worker) = self.decode_worker.lock().take() {
            if worker.join_timeout(DECODER_JOIN_TIMEOUT) {
                self.shared.decoder.lock().stop();
            }
        }
        self.shared.queue.flush();
    }

    pub fn stop_renderer(&self) {
        if !self.shared.rendering.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(mut worker) = self.render_worker.lock().take() {
            if worker.join_timeout(DECODER_JOIN_TIMEOUT) {
                self.shared.renderer.lock().stop();
            }
        }
    }

    pub fn stop(&self) {
        self.stop_decoder();
        self.stop_renderer();
    }

    pub fn is_running(&self) -> bool {
        self.shared.decoding.load(Ordering::SeqCst)
    }

    /// Queue one packet for decoding
    pub fn submit(&self, packet: Bytes) -> Result<()> {
        if !self.is_running() {
            return Err(Error::InvalidState("video decoder not running".into()));
        }
        if packet.len() > self.shared.config.max_frame_bytes {
            return Err(VideoError::FrameTooLarge(packet.len()).into());
        }
        self.shared.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.shared.queue.push(packet);
        Ok(())
    }

    pub fn stats(&self) -> VideoStats {
        let c = &self.shared.counters;
        VideoStats {
            packets_received: c.packets_received.load(Ordering::Relaxed),
            frames_decoded: c.frames_decoded.load(Ordering::Relaxed),
            frames_dropped: c.pool_drops.load(Ordering::Relaxed) + self.shared.queue.dropped(),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            frames_rendered: c.frames_rendered.load(Ordering::Relaxed),
            render_errors: c.render_errors.load(Ordering::Relaxed),
            average_decode_time_ms: self.shared.decode_times.lock().average_ms(),
        }
    }

    pub fn pool_available(&self) -> usize {
        self.shared.pool.available_count()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn decode_loop(&self) {
        let mut sequence = 0u64;
        while self.decoding.load(Ordering::SeqCst) {
            let Some(packet) = self.queue.pop_timeout(WORKER_POLL) else {
                continue;
            };
            if let Err(e) = self.decode_one(&packet, &mut sequence) {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Video decode failed: {}", e);
            }
        }
    }

    fn decode_one(&self, packet: &[u8], sequence: &mut u64) -> Result<()> {
        let started = Instant::now();
        let mut decoder = self.decoder.lock();
        let Some(picture) = decoder.decode(packet)? else {
            return Ok(());
        };
        self.decode_times.lock().record(started.elapsed());

        if picture.data.len() > self.config.max_frame_bytes {
            return Err(VideoError::FrameTooLarge(picture.data.len()).into());
        }
        let Some(mut slot) = self.pool.acquire_write() else {
            self.counters.pool_drops.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        slot.data.clear();
        slot.data.extend_from_slice(picture.data);
        slot.width = picture.width;
        slot.height = picture.height;
        slot.timestamp = monotonic_ms();
        slot.sequence = *sequence;
        *sequence += 1;
        slot.commit();

        self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn render_loop(&self) {
        while self.rendering.load(Ordering::SeqCst) {
            let Some(frame) = self.pool.acquire_read(WORKER_POLL) else {
                continue;
            };
            match self.renderer.lock().present(&frame) {
                Ok(()) => {
                    self.counters.frames_rendered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.render_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Video present failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Sender};

    /// Emits the packet itself as a 1x1 picture
    struct EchoDecoder {
        out: Vec<u8>,
    }

    impl VideoDecoder for EchoDecoder {
        fn decode(&mut self, packet: &[u8]) -> Result<Option<Picture<'_>>> {
            if packet.is_empty() {
                return Err(VideoError::Decoder("empty access unit".into()).into());
            }
            self.out.clear();
            self.out.extend_from_slice(packet);
            Ok(Some(Picture {
                data: &self.out,
                width: 1,
                height: 1,
            }))
        }
    }

    struct ChannelRenderer {
        frames: Sender<Vec<u8>>,
    }

    impl VideoRenderer for ChannelRenderer {
        fn present(&mut self, frame: &VideoFrame) -> Result<()> {
            let _ = self.frames.send(frame.data.clone());
            Ok(())
        }
    }

    fn pipeline(frames: Sender<Vec<u8>>) -> VideoPipeline {
        VideoPipeline::new(
            VideoConfig {
                max_frame_bytes: 64,
                ..VideoConfig::default()
            },
            Box::new(EchoDecoder { out: Vec::new() }),
            Box::new(ChannelRenderer { frames }),
        )
    }

    #[test]
    fn test_packets_reach_renderer() {
        let (tx, rx) = unbounded();
        let video = pipeline(tx);
        video.start().unwrap();

        for i in 0..5u8 {
            video.submit(Bytes::from(vec![i; 4])).unwrap();
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![i; 4]);
        }

        video.stop();
        let stats = video.stats();
        assert_eq!(stats.frames_decoded, 5);
        assert_eq!(stats.frames_rendered, 5);
        assert_eq!(video.pool_available(), VideoConfig::default().pool_size);
    }

    #[test]
    fn test_decode_errors_counted() {
        let (tx, _rx) = unbounded();
        let video = pipeline(tx);
        video.start().unwrap();
        video.submit(Bytes::new()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while video.stats().decode_errors == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(video.stats().decode_errors, 1);
    }

    #[test]
    fn test_submit_requires_running_and_size() {
        let (tx, _rx) = unbounded();
        let video = pipeline(tx);
        assert!(matches!(video.submit(Bytes::from_static(b"x")), Err(Error::InvalidState(_))));
        video.start().unwrap();
        assert!(matches!(
            video.submit(Bytes::from(vec![0u8; 65])),
            Err(Error::Video(VideoError::FrameTooLarge(65)))
        ));
    }
}
