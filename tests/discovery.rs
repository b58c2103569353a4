//! LAN discovery against a loopback responder

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use remote_play_core::config::DiscoveryConfig;
use remote_play_core::discovery::{DeviceType, DiscoveryListener, DiscoveryService, HostRecord};

const AWAKE_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nhost-name:Console-A\r\nhost-type:PS5\r\nhost-id:ABCDEF0123\r\nhost-request-port:9295\r\nsystem-version:07020001\r\n\r\n";
const STANDBY_RESPONSE: &[u8] = b"HTTP/1.1 620 Server Standby\r\n\r\n";

struct Responder {
    port: u16,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Responder {
    fn start(reply: &'static [u8]) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let port = socket.local_addr().unwrap().port();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            while flag.load(Ordering::SeqCst) {
                if let Ok((n, from)) = socket.recv_from(&mut buf) {
                    if buf[..n].starts_with(b"SRCH") {
                        let _ = socket.send_to(reply, from);
                    }
                }
            }
        });
        Self {
            port,
            running,
            handle: Some(handle),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Collector {
    done: Sender<Vec<HostRecord>>,
}

impl DiscoveryListener for Collector {
    fn on_host_found(&self, _host: &HostRecord) {}

    fn on_scan_complete(&self, hosts: &[HostRecord]) {
        let _ = self.done.send(hosts.to_vec());
    }
}

fn scan(responder: &Responder, timeout_ms: u64) -> (DiscoveryService, Receiver<Vec<HostRecord>>) {
    let config = DiscoveryConfig {
        scan_interval_ms: 200,
        scan_timeout_ms: timeout_ms,
        broadcast_address: Ipv4Addr::LOCALHOST,
        ps4_port: responder.port,
        ps5_port: responder.port,
        ..DiscoveryConfig::default()
    };
    let service = DiscoveryService::new(config).unwrap();
    let (tx, rx) = unbounded();
    service.scan_start(Arc::new(Collector { done: tx })).unwrap();
    (service, rx)
}

#[test]
fn test_discovery_happy_path() {
    let responder = Responder::start(AWAKE_RESPONSE);
    let (service, done) = scan(&responder, 3_000);
    assert!(service.local_port() > 0);

    let hosts = done.recv_timeout(Duration::from_secs(6)).unwrap();
    assert_eq!(hosts.len(), 1);
    let host = &hosts[0];
    assert_eq!(host.host_id, "ABCDEF0123");
    assert_eq!(host.device_type, DeviceType::Ps5);
    assert_eq!(host.request_port, 9295);
    assert_eq!(host.device_name, "Console-A");
    assert_eq!(host.firmware_version, 0x0702_0001);
    assert!(host.is_awake);
    assert!(host.signal_strength >= 0.6);
    assert!(!service.is_scanning());
}

#[test]
fn test_discovery_standby_status() {
    let responder = Responder::start(STANDBY_RESPONSE);
    let (service, done) = scan(&responder, 1_000);

    let hosts = done.recv_timeout(Duration::from_secs(4)).unwrap();
    assert_eq!(hosts.len(), 1);
    assert!(!hosts[0].is_awake);
    assert_eq!(service.results(), hosts);
}

#[test]
fn test_scan_stop_is_prompt() {
    let responder = Responder::start(AWAKE_RESPONSE);
    let (service, done) = scan(&responder, 60_000);
    std::thread::sleep(Duration::from_millis(100));

    let started = std::time::Instant::now();
    service.scan_stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(done.recv_timeout(Duration::from_secs(1)).is_ok());
}
