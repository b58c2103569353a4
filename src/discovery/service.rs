//! Background LAN scanner

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DiscoveryConfig;
use crate::constants::TAKION_CONTROL_PORT;
use crate::discovery::protocol::*;
use crate::error::{Error, NetworkError, Result};
use crate::network::{NetworkInfo, NetworkManager};
use crate::platform::{monotonic_ms, SelectResult, StopPipe, Worker};

/// Deadline for joining the scan worker
pub const SCAN_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Receiver of scan progress, called on the scan worker
pub trait DiscoveryListener: Send + Sync {
    /// A host was seen for the first time or its record changed
    fn on_host_found(&self, host: &HostRecord);

    /// The scan ended, by timeout or `scan_stop`
    fn on_scan_complete(&self, hosts: &[HostRecord]);
}

struct Shared {
    config: DiscoveryConfig,
    hosts: Mutex<Vec<HostRecord>>,
    running: AtomicBool,
    stop: StopPipe,
    local_port: AtomicU16,
}

impl Shared {
    /// Insert or update by `host_id`. Returns the stored record if the list
    /// changed.
    fn upsert(&self, record: HostRecord) -> Option<HostRecord> {
        let mut hosts = self.hosts.lock();
        if let Some(existing) = hosts.iter_mut().find(|h| h.host_id == record.host_id) {
            existing.is_awake = record.is_awake;
            existing.discovery_time = record.discovery_time;
            existing.last_seen = record.last_seen;
            existing.signal_strength = record.signal_strength;
            existing.ip = record.ip;
            return Some(existing.clone());
        }
        if hosts.len() >= self.config.max_hosts {
            tracing::debug!(host_id = %record.host_id, "Discovery list full, dropping host");
            return None;
        }
        hosts.push(record.clone());
        Some(record)
    }
}

/// LAN discovery
pub struct DiscoveryService {
    shared: Arc<Shared>,
    network: Option<NetworkManager>,
    worker: Mutex<Option<Worker>>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let stop = StopPipe::new().map_err(|e| NetworkError::SocketSetup(format!("stop pipe: {e}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                hosts: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stop,
                local_port: AtomicU16::new(0),
            }),
            network: None,
            worker: Mutex::new(None),
        })
    }

    /// Use the network manager to recognize same-subnet hosts
    pub fn with_network(mut self, network: NetworkManager) -> Self {
        self.network = Some(network);
        self
    }

    /// Start a background scan
    pub fn scan_start(&self, listener: Arc<dyn DiscoveryListener>) -> Result<()> {
        // Held until the new worker is stored, so concurrent starts serialize here
        let mut slot = self.worker.lock();
        if self.is_scanning() {
            return Err(Error::InvalidState("scan already running".into()));
        }
        // Reap a worker that finished on its own
        if let Some(mut worker) = slot.take() {
            worker.join_timeout(SCAN_JOIN_TIMEOUT);
        }

        let socket = open_broadcast_socket()?;
        let port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        self.shared.local_port.store(port, Ordering::SeqCst);

        let local = self.network.as_ref().and_then(|n| n.info().ok());

        self.shared.stop.reset();
        self.shared.running.store(true, Ordering::SeqCst);
        tracing::info!(
            port,
            timeout_ms = self.shared.config.scan_timeout_ms,
            "Discovery scan started"
        );

        let shared = self.shared.clone();
        let worker = Worker::spawn("discovery", move || {
            scan_loop(&shared, &socket, local.as_ref(), listener.as_ref());
        })
        .map_err(|e| {
            self.shared.running.store(false, Ordering::SeqCst);
            Error::Init(format!("discovery worker: {e}"))
        })?;
        *slot = Some(worker);
        Ok(())
    }

    /// Stop scanning and join the worker
    pub fn scan_stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.stop.stop();
        if let Some(mut worker) = self.worker.lock().take() {
            worker.join_timeout(SCAN_JOIN_TIMEOUT);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Ephemeral port of the most recent scan socket
    pub fn local_port(&self) -> u16 {
        self.shared.local_port.load(Ordering::SeqCst)
    }

    /// Snapshot of discovered hosts
    pub fn results(&self) -> Vec<HostRecord> {
        self.shared.hosts.lock().clone()
    }

    pub fn find(&self, host_id: &str) -> Option<HostRecord> {
        self.shared.hosts.lock().iter().find(|h| h.host_id == host_id).cloned()
    }

    /// Insert a host by address, keyed `manual_<ip>`
    pub fn add_manual(&self, ip: Ipv4Addr, name: &str, device_type: DeviceType) -> Result<HostRecord> {
        if ip.is_unspecified() || ip.is_broadcast() {
            return Err(Error::InvalidParam(format!("not a host address: {ip}")));
        }
        let record = HostRecord {
            host_id: format!("manual_{ip}"),
            ip,
            request_port: TAKION_CONTROL_PORT,
            device_type,
            device_name: if name.is_empty() { ip.to_string() } else { name.to_string() },
            firmware_version: 0,
            is_awake: true,
            signal_strength: 0.0,
            discovery_time: monotonic_ms(),
            last_seen: chrono::Utc::now(),
        };
        self.shared
            .upsert(record)
            .ok_or_else(|| Error::InvalidState("discovery list is full".into()))
    }

    pub fn clear(&self) {
        self.shared.hosts.lock().clear();
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.scan_stop();
    }
}

fn open_broadcast_socket() -> Result<UdpSocket> {
    let setup = |e: io::Error| NetworkError::SocketSetup(format!("discovery socket: {e}"));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(setup)?;
    socket.set_broadcast(true).map_err(setup)?;
    socket.set_nonblocking(true).map_err(setup)?;
    let any = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&any.into()).map_err(setup)?;
    Ok(socket.into())
}

fn send_probes(config: &DiscoveryConfig, socket: &UdpSocket) {
    for (probe, port) in [(PROBE_PS4, config.ps4_port), (PROBE_PS5, config.ps5_port)] {
        let target = SocketAddrV4::new(config.broadcast_address, port);
        if let Err(e) = socket.send_to(probe, target) {
            tracing::warn!(%target, "Discovery probe send failed: {}", e);
        }
    }
}

fn scan_loop(shared: &Shared, socket: &UdpSocket, local: Option<&NetworkInfo>, listener: &dyn DiscoveryListener) {
    let config = &shared.config;
    let started = Instant::now();
    let deadline = started + Duration::from_millis(config.scan_timeout_ms);
    let interval = Duration::from_millis(config.scan_interval_ms);
    let mut next_probe = started;
    let mut last_probe = started;
    let mut buf = [0u8; 2048];

    while shared.running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if now >= next_probe {
            send_probes(config, socket);
            last_probe = now;
            next_probe = now + interval;
        }

        let wait = next_probe.min(deadline).saturating_duration_since(Instant::now());
        match shared.stop.select_single(socket.as_raw_fd(), false, Some(wait)) {
            SelectResult::Ready => {}
            SelectResult::Timeout => continue,
            SelectResult::Canceled => break,
            SelectResult::Error(e) => {
                tracing::warn!("Discovery select failed: {}", e);
                break;
            }
        }

        loop {
            let (n, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!("Discovery receive error: {}", e);
                    break;
                }
            };
            let IpAddr::V4(ip) = from.ip() else {
                continue;
            };

            let response = match DiscoveryResponse::parse(&buf[..n]) {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(%from, "Ignoring discovery datagram: {}", e);
                    continue;
                }
            };

            let same_subnet = local.is_some_and(|info| info.same_subnet(ip));
            let strength = signal_strength(last_probe.elapsed(), same_subnet);
            let record = HostRecord::from_response(&response, ip, TAKION_CONTROL_PORT, strength, monotonic_ms());
            if let Some(stored) = shared.upsert(record) {
                tracing::debug!(
                    host_id = %stored.host_id,
                    %ip,
                    device = %stored.device_type,
                    awake = stored.is_awake,
                    "Discovered host"
                );
                listener.on_host_found(&stored);
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    let hosts = shared.hosts.lock().clone();
    tracing::info!(hosts = hosts.len(), "Discovery scan complete");
    listener.on_scan_complete(&hosts);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> DiscoveryService {
        DiscoveryService::new(DiscoveryConfig {
            max_hosts: 2,
            ..DiscoveryConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_add_manual() {
        let service = service();
        let record = service
            .add_manual(Ipv4Addr::new(10, 0, 0, 7), "Den", DeviceType::Ps4)
            .unwrap();
        assert_eq!(record.host_id, "manual_10.0.0.7");
        assert!(service.find("manual_10.0.0.7").is_some());

        // Re-adding updates in place
        service.add_manual(Ipv4Addr::new(10, 0, 0, 7), "Den", DeviceType::Ps4).unwrap();
        assert_eq!(service.results().len(), 1);
    }

    #[test]
    fn test_list_capacity() {
        let service = service();
        service.add_manual(Ipv4Addr::new(10, 0, 0, 1), "", DeviceType::Ps5).unwrap();
        service.add_manual(Ipv4Addr::new(10, 0, 0, 2), "", DeviceType::Ps5).unwrap();
        assert!(service.add_manual(Ipv4Addr::new(10, 0, 0, 3), "", DeviceType::Ps5).is_err());
        assert_eq!(service.results().len(), 2);

        service.clear();
        assert!(service.results().is_empty());
    }

    #[test]
    fn test_rejects_broadcast_manual() {
        let service = service();
        assert!(service.add_manual(Ipv4Addr::BROADCAST, "", DeviceType::Ps5).is_err());
    }

    struct Quiet;

    impl DiscoveryListener for Quiet {
        fn on_host_found(&self, _host: &HostRecord) {}
        fn on_scan_complete(&self, _hosts: &[HostRecord]) {}
    }

    #[test]
    fn test_concurrent_scan_start_spawns_one_worker() {
        let service = Arc::new(
            DiscoveryService::new(DiscoveryConfig {
                broadcast_address: Ipv4Addr::LOCALHOST,
                scan_timeout_ms: 2_000,
                ..DiscoveryConfig::default()
            })
            .unwrap(),
        );
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let starters: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    service.scan_start(Arc::new(Quiet)).is_ok()
                })
            })
            .collect();

        let started = starters.into_iter().map(|h| h.join().unwrap()).filter(|&ok| ok).count();
        assert_eq!(started, 1);
        assert!(service.is_scanning());
        service.scan_stop();
        assert!(!service.is_scanning());
    }

    #[test]
    fn test_broadcast_socket_ephemeral() {
        let socket = open_broadcast_socket().unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
        assert!(socket.broadcast().unwrap());
    }
}
