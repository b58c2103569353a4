//! UDP session keepalive
//!
//! Sends `KEEP:<ms>` every interval on its own connected socket and
//! harvests echoes to estimate round-trip time.

use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::KeepaliveConfig;
use crate::error::{Error, NetworkError, Result};
use crate::platform::{monotonic_ms, SelectResult, StopPipe, Worker};

pub const KEEPALIVE_PACKET_SIZE: usize = 64;

/// Deadline for joining the keepalive worker
pub const KEEPALIVE_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

const PREFIX: &[u8] = b"KEEP:";

/// Keepalive health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveStatus {
    Stopped,
    Active,
    Failed,
}

/// Keepalive callbacks, invoked on the keepalive worker
pub trait KeepaliveListener: Send + Sync {
    fn on_status_changed(&self, status: KeepaliveStatus);
}

/// Counters and smoothed RTT
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KeepaliveStats {
    pub sent: u64,
    pub received: u64,
    pub consecutive_failures: u32,
    pub last_rtt_ms: Option<u64>,
    pub average_rtt_ms: Option<f64>,
}

impl KeepaliveStats {
    /// Fold a new RTT sample into the moving average
    pub fn record_rtt(&mut self, rtt_ms: u64) {
        self.last_rtt_ms = Some(rtt_ms);
        self.average_rtt_ms = Some(match self.average_rtt_ms {
            None => rtt_ms as f64,
            Some(avg) => (3.0 * avg + rtt_ms as f64) / 4.0,
        });
    }
}

/// Encode a keepalive packet, zero-padded to 64 bytes
pub fn encode_keepalive(timestamp_ms: u64) -> [u8; KEEPALIVE_PACKET_SIZE] {
    let mut packet = [0u8; KEEPALIVE_PACKET_SIZE];
    let text = format!("KEEP:{timestamp_ms}");
    let len = text.len().min(KEEPALIVE_PACKET_SIZE);
    packet[..len].copy_from_slice(&text.as_bytes()[..len]);
    packet
}

/// Timestamp embedded in a keepalive packet or echo
pub fn decode_keepalive(packet: &[u8]) -> Option<u64> {
    let rest = packet.strip_prefix(PREFIX)?;
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    std::str::from_utf8(&rest[..end]).ok()?.trim().parse().ok()
}

struct Shared {
    config: KeepaliveConfig,
    socket: UdpSocket,
    running: AtomicBool,
    stop: StopPipe,
    status: Mutex<KeepaliveStatus>,
    stats: Mutex<KeepaliveStats>,
    listener: Weak<dyn KeepaliveListener>,
}

/// Running keepalive
pub struct Keepalive {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Keepalive {
    /// Open the socket and start sending
    pub fn start(peer: SocketAddr, config: KeepaliveConfig, listener: Weak<dyn KeepaliveListener>) -> Result<Self> {
        if config.interval_ms == 0 {
            return Err(Error::InvalidParam("keepalive interval must be non-zero".into()));
        }
        let setup = |e: io::Error| NetworkError::SocketSetup(format!("keepalive socket: {e}"));
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(setup)?;
        socket.connect(peer).map_err(setup)?;
        socket.set_nonblocking(true).map_err(setup)?;
        let stop = StopPipe::new().map_err(setup)?;

        let shared = Arc::new(Shared {
            config,
            socket,
            running: AtomicBool::new(true),
            stop,
            status: Mutex::new(KeepaliveStatus::Active),
            stats: Mutex::new(KeepaliveStats::default()),
            listener,
        });

        let worker_shared = shared.clone();
        let worker = Worker::spawn("keepalive", move || worker_shared.run())
            .map_err(|e| Error::Init(format!("keepalive worker: {e}")))?;

        tracing::debug!(%peer, "Keepalive started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn status(&self) -> KeepaliveStatus {
        *self.shared.status.lock()
    }

    pub fn stats(&self) -> KeepaliveStats {
        *self.shared.stats.lock()
    }

    /// Stop sending and join the worker
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.stop.stop();
        if let Some(mut worker) = self.worker.lock().take() {
            worker.join_timeout(KEEPALIVE_JOIN_TIMEOUT);
        }
        self.shared.set_status(KeepaliveStatus::Stopped);
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn set_status(&self, status: KeepaliveStatus) {
        let changed = {
            let mut current = self.status.lock();
            std::mem::replace(&mut *current, status) != status
        };
        if changed {
            tracing::debug!("Keepalive status {:?}", status);
            if let Some(listener) = self.listener.upgrade() {
                listener.on_status_changed(status);
            }
        }
    }

    fn run(&self) {
        let interval = Duration::from_millis(self.config.interval_ms);
        let fd = self.socket.as_raw_fd();
        let mut buf = [0u8; KEEPALIVE_PACKET_SIZE * 2];
        let mut next_send = monotonic_ms();

        while self.running.load(Ordering::SeqCst) {
            let now = monotonic_ms();
            if now >= next_send {
                self.send_one(now);
                next_send = now + interval.as_millis() as u64;
            }

            let wait = Duration::from_millis(next_send.saturating_sub(monotonic_ms()));
            match self.stop.select_single(fd, false, Some(wait)) {
                SelectResult::Ready => self.harvest(&mut buf),
                SelectResult::Timeout => {}
                SelectResult::Canceled => break,
                SelectResult::Error(e) => {
                    tracing::warn!("Keepalive select failed: {}", e);
                    break;
                }
            }
        }
    }

    fn send_one(&self, now: u64) {
        match self.socket.send(&encode_keepalive(now)) {
            Ok(_) => {
                let recovered = {
                    let mut stats = self.stats.lock();
                    stats.sent += 1;
                    std::mem::take(&mut stats.consecutive_failures) >= self.config.max_failures
                };
                if recovered {
                    self.set_status(KeepaliveStatus::Active);
                }
            }
            Err(e) => {
                let failures = {
                    let mut stats = self.stats.lock();
                    stats.consecutive_failures += 1;
                    stats.consecutive_failures
                };
                tracing::debug!(failures, "Keepalive send failed: {}", e);
                if failures == self.config.max_failures {
                    tracing::warn!(failures, "Keepalive failed");
                    self.set_status(KeepaliveStatus::Failed);
                }
            }
        }
    }

    fn harvest(&self, buf: &mut [u8]) {
        loop {
            let n = match self.socket.recv(buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::trace!("Keepalive receive error: {}", e);
                    return;
                }
            };
            let Some(sent_at) = decode_keepalive(&buf[..n]) else {
                continue;
            };
            let now = monotonic_ms();
            if sent_at > now {
                continue;
            }
            let rtt = now - sent_at;
            {
                let mut stats = self.stats.lock();
                stats.received += 1;
                stats.record_rtt(rtt);
            }
            self.set_status(KeepaliveStatus::Active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullListener;

    impl KeepaliveListener for NullListener {
        fn on_status_changed(&self, _status: KeepaliveStatus) {}
    }

    #[test]
    fn test_packet_layout() {
        let packet = encode_keepalive(123_456);
        assert_eq!(packet.len(), 64);
        assert!(packet.starts_with(b"KEEP:123456"));
        assert!(packet[11..].iter().all(|&b| b == 0));
        assert_eq!(decode_keepalive(&packet), Some(123_456));
        assert_eq!(decode_keepalive(b"PING:1"), None);
    }

    #[test]
    fn test_rtt_average() {
        let mut stats = KeepaliveStats::default();
        stats.record_rtt(100);
        assert_eq!(stats.average_rtt_ms, Some(100.0));
        stats.record_rtt(20);
        assert_eq!(stats.average_rtt_ms, Some(80.0));
    }

    #[test]
    fn test_rtt_bounded_after_losses() {
        let mut stats = KeepaliveStats {
            consecutive_failures: 5,
            ..KeepaliveStats::default()
        };
        stats.record_rtt(40);
        let avg = stats.average_rtt_ms.unwrap();
        assert!(avg.is_finite());
        assert_eq!(avg, 40.0);
    }

    #[test]
    fn test_echo_measures_rtt() {
        let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
        echo.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = echo.local_addr().unwrap();
        let echo_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 128];
            let (n, from) = echo.recv_from(&mut buf).unwrap();
            echo.send_to(&buf[..n], from).unwrap();
            echo
        });

        let listener: Arc<dyn KeepaliveListener> = Arc::new(NullListener);
        let config = KeepaliveConfig {
            enabled: true,
            interval_ms: 50,
            ..KeepaliveConfig::default()
        };
        let keepalive = Keepalive::start(addr, config, Arc::downgrade(&listener)).unwrap();
        let _echo = echo_thread.join().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while keepalive.stats().received == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = keepalive.stats();
        assert_eq!(stats.received, 1);
        assert!(stats.average_rtt_ms.is_some());
        assert_eq!(keepalive.status(), KeepaliveStatus::Active);

        keepalive.stop();
        assert_eq!(keepalive.status(), KeepaliveStatus::Stopped);
    }
}
