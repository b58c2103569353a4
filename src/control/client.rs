//! TCP control-plane connection

use bytes::BytesMut;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::ControlConfig;
use crate::control::message::{ControlMessage, ControlType};
use crate::error::{Error, NetworkError, Result};
use crate::platform::{connect_tcp, monotonic_ms, SelectResult, StopPipe, Worker};

/// Deadline for joining the control worker
pub const CONTROL_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Control-plane callbacks, invoked on the control worker
pub trait ControlListener: Send + Sync {
    fn on_version(&self, _version: &str) {}

    /// Peer reported an error; `code` is the message flags byte
    fn on_error(&self, _code: u8, _message: &str) {}

    fn on_connection_lost(&self) {}
}

struct Shared {
    config: ControlConfig,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    running: AtomicBool,
    stop: StopPipe,
    last_received_ms: AtomicU64,
    bangs_sent: AtomicU64,
    server_version: Mutex<Option<String>>,
    listener: Weak<dyn ControlListener>,
}

/// Connected control plane with its update worker
pub struct ControlPlane {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl ControlPlane {
    /// Connect, announce our version and start the update loop
    pub fn connect(peer: SocketAddr, config: ControlConfig, listener: Weak<dyn ControlListener>) -> Result<Self> {
        let stop = StopPipe::new().map_err(|e| NetworkError::SocketSetup(format!("stop pipe: {e}")))?;
        let stream = connect_tcp(peer, Some(Duration::from_millis(config.connect_timeout_ms)), &stop)
            .map_err(|kind| kind.into_error(peer))?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(Duration::from_millis(config.connection_timeout_ms)))?;
        let reader = stream.try_clone()?;

        let version_req = ControlMessage::new(ControlType::VersionReq, config.client_version.clone().into_bytes())?;

        let shared = Arc::new(Shared {
            config,
            peer,
            writer: Mutex::new(stream),
            running: AtomicBool::new(true),
            stop,
            last_received_ms: AtomicU64::new(monotonic_ms()),
            bangs_sent: AtomicU64::new(0),
            server_version: Mutex::new(None),
            listener,
        });
        shared.send(&version_req)?;

        let worker_shared = shared.clone();
        let worker = Worker::spawn("control-plane", move || worker_shared.update_loop(reader))
            .map_err(|e| Error::Init(format!("control worker: {e}")))?;

        tracing::info!(%peer, "Control plane connected");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Send an input event
    pub fn send_input(&self, payload: &[u8]) -> Result<()> {
        self.ensure_running()?;
        let msg = ControlMessage::new(ControlType::Input, payload.to_vec())?;
        self.shared.send(&msg)
    }

    /// Send a session-control message
    pub fn send_session_ctrl(&self, payload: &[u8]) -> Result<()> {
        self.ensure_running()?;
        let msg = ControlMessage::new(ControlType::SessionCtrl, payload.to_vec())?;
        self.shared.send(&msg)
    }

    /// Version reported in the peer's VERSION_RSP
    pub fn server_version(&self) -> Option<String> {
        self.shared.server_version.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn bangs_sent(&self) -> u64 {
        self.shared.bangs_sent.load(Ordering::Relaxed)
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Stop the worker and close the connection
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.stop.stop();
        if let Some(mut worker) = self.worker.lock().take() {
            worker.join_timeout(CONTROL_JOIN_TIMEOUT);
        }
        let _ = self.shared.writer.lock().shutdown(Shutdown::Both);
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn send(&self, msg: &ControlMessage) -> Result<()> {
        self.writer
            .lock()
            .write_all(&msg.encode())
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn update_loop(&self, mut reader: TcpStream) {
        let interval = Duration::from_millis(self.config.keepalive_interval_ms);
        let timeout_ms = self.config.connection_timeout_ms;
        let fd = reader.as_raw_fd();
        let mut pending = BytesMut::with_capacity(4096);
        let mut chunk = [0u8; 2048];
        let mut next_bang = monotonic_ms();

        while self.running.load(Ordering::SeqCst) {
            let now = monotonic_ms();
            if now >= next_bang {
                if let Err(e) = self.send(&ControlMessage::bang(now as u32)) {
                    tracing::warn!("Control BANG send failed: {}", e);
                } else {
                    self.bangs_sent.fetch_add(1, Ordering::Relaxed);
                }
                next_bang = now + interval.as_millis() as u64;
            }

            let silent_for = monotonic_ms().saturating_sub(self.last_received_ms.load(Ordering::SeqCst));
            if silent_for > timeout_ms {
                self.connection_lost(&format!("no data for {silent_for} ms"));
                return;
            }

            let wait = Duration::from_millis(next_bang.saturating_sub(monotonic_ms()));
            match self.stop.select_single(fd, false, Some(wait)) {
                SelectResult::Ready => {}
                SelectResult::Timeout => continue,
                SelectResult::Canceled => break,
                SelectResult::Error(e) => {
                    tracing::warn!("Control select failed: {}", e);
                    break;
                }
            }

            match reader.read(&mut chunk) {
                Ok(0) => {
                    self.connection_lost("peer closed the connection");
                    return;
                }
                Ok(n) => {
                    self.last_received_ms.store(monotonic_ms(), Ordering::SeqCst);
                    pending.extend_from_slice(&chunk[..n]);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
                Err(e) => {
                    self.connection_lost(&e.to_string());
                    return;
                }
            }

            loop {
                match ControlMessage::try_decode(&mut pending) {
                    Ok(Some(msg)) => self.handle(msg),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Control stream corrupt, resetting buffer: {}", e);
                        pending.clear();
                        break;
                    }
                }
            }
        }
        tracing::debug!("Control loop exited");
    }

    fn handle(&self, msg: ControlMessage) {
        match msg.msg_type {
            ControlType::VersionRsp => {
                let version = msg.text();
                tracing::info!(version = %version, "Peer control version");
                *self.server_version.lock() = Some(version.clone());
                if let Some(listener) = self.listener.upgrade() {
                    listener.on_version(&version);
                }
            }
            ControlType::Bang => {}
            ControlType::Error => {
                let message = msg.text();
                tracing::warn!(code = msg.flags, "Peer control error: {}", message);
                if let Some(listener) = self.listener.upgrade() {
                    listener.on_error(msg.flags, &message);
                }
            }
            other => tracing::debug!("Ignoring control message {:?}", other),
        }
    }

    fn connection_lost(&self, reason: &str) {
        tracing::warn!(peer = %self.peer, "Control connection lost: {}", reason);
        self.running.store(false, Ordering::SeqCst);
        if let Some(listener) = self.listener.upgrade() {
            listener.on_connection_lost();
        }
    }
}
