//! Network manager
//!
//! Reference-counted ownership of the host network stack. The first `init`
//! brings the stack up through a [`NetworkBackend`]; the last `cleanup` tears
//! it down. Interface information is cached with a short TTL.

use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};

/// Network stack lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Uninit,
    Initing,
    Available,
    Error,
    Offline,
}

/// Cached interface description
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    pub connected: bool,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_primary: Option<Ipv4Addr>,
    pub dns_secondary: Option<Ipv4Addr>,
    /// 0.0..=1.0, `None` on wired links
    pub signal_strength: Option<f32>,
}

impl NetworkInfo {
    /// Whether `peer` shares our subnet
    pub fn same_subnet(&self, peer: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.ip) & mask == u32::from(peer) & mask
    }
}

/// OS-facing half of the network manager
pub trait NetworkBackend: Send + Sync {
    /// Bring the stack up; called by the first `init`
    fn bring_up(&self) -> Result<()>;

    /// Tear the stack down; called by the last `cleanup`
    fn tear_down(&self);

    /// Query the current interface state
    fn query(&self) -> Result<NetworkInfo>;
}

/// Backend for hosted systems where sockets need no explicit stack setup
#[derive(Debug, Default)]
pub struct SystemBackend;

impl NetworkBackend for SystemBackend {
    fn bring_up(&self) -> Result<()> {
        Ok(())
    }

    fn tear_down(&self) {}

    fn query(&self) -> Result<NetworkInfo> {
        // Connecting a UDP socket selects the outbound interface without sending
        let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let connected = probe.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).is_ok();
        let ip = match probe.local_addr() {
            Ok(SocketAddr::V4(addr)) if connected => *addr.ip(),
            _ => Ipv4Addr::LOCALHOST,
        };

        Ok(NetworkInfo {
            connected: connected && !ip.is_loopback(),
            ip,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            dns_primary: None,
            dns_secondary: None,
            signal_strength: None,
        })
    }
}

struct Inner {
    ref_count: usize,
    state: NetworkState,
    cached: Option<(Instant, NetworkInfo)>,
}

struct Shared {
    backend: Box<dyn NetworkBackend>,
    config: NetworkConfig,
    inner: Mutex<Inner>,
}

/// Clonable handle to the process network stack
#[derive(Clone)]
pub struct NetworkManager {
    shared: Arc<Shared>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_backend(config, Box::new(SystemBackend))
    }

    pub fn with_backend(config: NetworkConfig, backend: Box<dyn NetworkBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                inner: Mutex::new(Inner {
                    ref_count: 0,
                    state: NetworkState::Uninit,
                    cached: None,
                }),
            }),
        }
    }

    /// Take a reference on the stack, bringing it up on first use.
    ///
    /// A backend failure downgrades to `Offline` unless the configuration
    /// requires the network.
    pub fn init(&self) -> Result<NetworkState> {
        if self.shared.config.force_offline {
            return Err(Error::Offline);
        }

        let mut inner = self.shared.inner.lock();
        inner.ref_count += 1;
        if inner.ref_count > 1 {
            return Ok(inner.state);
        }

        inner.state = NetworkState::Initing;
        match self.shared.backend.bring_up() {
            Ok(()) => {
                inner.state = NetworkState::Available;
                tracing::debug!("Network stack initialized");
                Ok(NetworkState::Available)
            }
            Err(e) if self.shared.config.require_network => {
                inner.ref_count -= 1;
                inner.state = NetworkState::Error;
                tracing::error!("Network stack failed to initialize: {}", e);
                Err(Error::Init(format!("network stack: {e}")))
            }
            Err(e) => {
                inner.state = NetworkState::Offline;
                tracing::warn!("Network stack unavailable, continuing offline: {}", e);
                Ok(NetworkState::Offline)
            }
        }
    }

    /// Release a reference, tearing the stack down on the last one
    pub fn cleanup(&self) {
        let mut inner = self.shared.inner.lock();
        match inner.ref_count {
            0 => tracing::warn!("Network cleanup without matching init"),
            1 => {
                inner.ref_count = 0;
                if inner.state == NetworkState::Available {
                    self.shared.backend.tear_down();
                }
                inner.state = NetworkState::Uninit;
                inner.cached = None;
                tracing::debug!("Network stack released");
            }
            _ => inner.ref_count -= 1,
        }
    }

    /// RAII reference that calls `cleanup` on drop
    pub fn acquire(&self) -> Result<NetworkLease> {
        self.init()?;
        Ok(NetworkLease {
            manager: self.clone(),
        })
    }

    pub fn state(&self) -> NetworkState {
        if self.shared.config.force_offline {
            return NetworkState::Offline;
        }
        self.shared.inner.lock().state
    }

    pub fn ref_count(&self) -> usize {
        self.shared.inner.lock().ref_count
    }

    pub fn is_offline(&self) -> bool {
        self.state() == NetworkState::Offline
    }

    /// Interface info, served from cache while fresh
    pub fn info(&self) -> Result<NetworkInfo> {
        let ttl = Duration::from_millis(self.shared.config.info_ttl_ms);
        {
            let inner = self.shared.inner.lock();
            self.ensure_usable(&inner)?;
            if let Some((at, info)) = &inner.cached {
                if at.elapsed() < ttl {
                    return Ok(info.clone());
                }
            }
        }
        self.refresh()
    }

    /// Re-query the backend and replace the cache
    pub fn refresh(&self) -> Result<NetworkInfo> {
        {
            let inner = self.shared.inner.lock();
            self.ensure_usable(&inner)?;
        }
        let info = self.shared.backend.query()?;
        self.shared.inner.lock().cached = Some((Instant::now(), info.clone()));
        Ok(info)
    }

    fn ensure_usable(&self, inner: &Inner) -> Result<()> {
        if self.shared.config.force_offline {
            return Err(Error::Offline);
        }
        match inner.state {
            NetworkState::Available => Ok(()),
            NetworkState::Offline => Err(Error::Offline),
            _ => Err(Error::NotInitialized("network manager")),
        }
    }
}

/// Scoped reference on the network stack
pub struct NetworkLease {
    manager: NetworkManager,
}

impl NetworkLease {
    pub fn manager(&self) -> &NetworkManager {
        &self.manager
    }
}

impl Drop for NetworkLease {
    fn drop(&mut self) {
        self.manager.cleanup();
    }
}
