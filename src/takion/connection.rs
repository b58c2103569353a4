//! Takion association over a pair of connected UDP sockets
//!
//! One socket talks to the peer's control port, the other to its stream
//! port. The handshake runs on the control socket in the caller's thread;
//! once connected a single network worker receives from both sockets through
//! the stop-pipe and forwards payloads to the registered listener.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::config::{PeerClass, TakionConfig};
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::platform::{monotonic_ms, EitherResult, SelectResult, StopPipe, Worker};
use crate::retry::{self, CancelableClock, RetryPolicy};
use crate::takion::message::*;
use crate::takion::state::TakionState;

/// Deadline for joining the network worker
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Receiver of transport events.
///
/// Held weakly by the transport; callbacks run on the network worker or on
/// the thread driving `connect`/`disconnect`.
pub trait TakionListener: Send + Sync {
    fn on_state_changed(&self, old: TakionState, new: TakionState);

    fn on_data(&self, kind: DataKind, payload: Bytes);
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TakionStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub parse_errors: u64,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    parse_errors: AtomicU64,
}

struct Sockets {
    control: UdpSocket,
    stream: UdpSocket,
}

struct Shared {
    config: TakionConfig,
    control_addr: SocketAddr,
    stream_addr: SocketAddr,
    local_tag: u32,
    remote_tag: AtomicU32,
    sequence: AtomicU32,
    input_key_pos: AtomicU32,
    sockets: RwLock<Option<Arc<Sockets>>>,
    state: Mutex<TakionState>,
    running: AtomicBool,
    /// Sticky until the next `disconnect`; survives the reset at `connect`
    canceled: AtomicBool,
    stop: StopPipe,
    connect_started_ms: AtomicU64,
    last_packet_ms: AtomicU64,
    connected_at: Mutex<Option<Instant>>,
    timeout_logged: AtomicBool,
    counters: Counters,
    listener: Weak<dyn TakionListener>,
}

/// One Takion association
pub struct TakionConnection {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    handshake_policy: RetryPolicy,
}

impl TakionConnection {
    /// Create an idle connection to `peer` with a fresh non-zero local tag
    pub fn new(peer: IpAddr, config: TakionConfig, listener: Weak<dyn TakionListener>) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let local_tag = loop {
            let tag: u32 = rng.gen();
            if tag != 0 {
                break tag;
            }
        };

        let stop = StopPipe::new().map_err(|e| NetworkError::SocketSetup(format!("stop pipe: {e}")))?;

        Ok(Self {
            shared: Arc::new(Shared {
                control_addr: SocketAddr::new(peer, config.control_port),
                stream_addr: SocketAddr::new(peer, config.stream_port),
                config,
                local_tag,
                remote_tag: AtomicU32::new(0),
                sequence: AtomicU32::new(0),
                input_key_pos: AtomicU32::new(0),
                sockets: RwLock::new(None),
                state: Mutex::new(TakionState::Idle),
                running: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                stop,
                connect_started_ms: AtomicU64::new(0),
                last_packet_ms: AtomicU64::new(0),
                connected_at: Mutex::new(None),
                timeout_logged: AtomicBool::new(false),
                counters: Counters::default(),
                listener,
            }),
            worker: Mutex::new(None),
            handshake_policy: RetryPolicy::session_init(),
        })
    }

    /// Override the handshake retry policy
    pub fn with_handshake_policy(mut self, policy: RetryPolicy) -> Self {
        self.handshake_policy = policy;
        self
    }

    pub fn state(&self) -> TakionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TakionState::Connected
    }

    pub fn local_tag(&self) -> u32 {
        self.shared.local_tag
    }

    pub fn remote_tag(&self) -> u32 {
        self.shared.remote_tag.load(Ordering::SeqCst)
    }

    /// Record a remote tag learned outside the handshake (fast path)
    pub fn set_remote_tag(&self, tag: u32) {
        self.shared.remote_tag.store(tag, Ordering::SeqCst);
    }

    /// Whether the handshake was skipped for a PS5-class peer
    pub fn is_fast_path(&self) -> bool {
        self.shared.config.peer_class == PeerClass::Ps5
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.shared.control_addr
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.shared.stream_addr
    }

    /// Time since the association was established
    pub fn connected_for(&self) -> Option<Duration> {
        self.shared.connected_at.lock().map(|at| at.elapsed())
    }

    pub fn stats(&self) -> TakionStats {
        let c = &self.shared.counters;
        TakionStats {
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            parse_errors: c.parse_errors.load(Ordering::Relaxed),
        }
    }

    /// Establish the association and start the network worker
    pub fn connect(&self) -> Result<()> {
        let current = self.state();
        if !matches!(current, TakionState::Idle | TakionState::Error) {
            return Err(Error::InvalidState(format!("cannot connect from {current}")));
        }

        // A worker left behind by a peer-initiated disconnect has already exited
        let _ = self.shared.stop.stop();
        self.join_worker();
        self.shared.stop.reset();
        if self.shared.canceled.load(Ordering::SeqCst) {
            return Err(NetworkError::Canceled.into());
        }
        self.shared.transition(TakionState::Connecting);

        if let Err(e) = self.establish() {
            self.shared.close_sockets();
            self.shared.transition(TakionState::Error);
            return Err(e);
        }

        *self.shared.connected_at.lock() = Some(Instant::now());
        self.start_worker()?;
        tracing::info!(
            peer = %self.shared.control_addr,
            local_tag = format_args!("{:#010x}", self.shared.local_tag),
            remote_tag = format_args!("{:#010x}", self.remote_tag()),
            "Takion connected"
        );
        Ok(())
    }

    fn establish(&self) -> Result<()> {
        let shared = &self.shared;
        let sockets = shared.open_sockets()?;
        shared.probe_reachability(&sockets)?;
        if shared.canceled.load(Ordering::SeqCst) {
            return Err(NetworkError::Canceled.into());
        }

        if self.is_fast_path() {
            tracing::debug!("PS5-class peer, skipping INIT/COOKIE handshake");
            shared.transition(TakionState::Connected);
            return Ok(());
        }

        let clock = CancelableClock { stop: &shared.stop };
        retry::execute_with(&self.handshake_policy, &clock, |ctx| {
            if ctx.attempt > 1 {
                shared.close_sockets();
                shared.open_sockets()?;
                shared.transition(TakionState::Connecting);
                tracing::info!(attempt = ctx.attempt, "Retrying Takion handshake");
            }
            shared.begin_attempt();
            let sockets = shared.current_sockets().ok_or(Error::NotConnected)?;
            shared.handshake(&sockets)
        })
    }

    fn start_worker(&self) -> Result<()> {
        let sockets = self.shared.current_sockets().ok_or(Error::NotConnected)?;
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let worker = Worker::spawn("takion-net", move || shared.receive_loop(sockets)).map_err(|e| {
            self.shared.running.store(false, Ordering::SeqCst);
            Error::Init(format!("takion worker: {e}"))
        })?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    fn join_worker(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.join_timeout(WORKER_JOIN_TIMEOUT);
        }
    }

    /// Interrupt a `connect` blocked in socket setup, the handshake or its
    /// backoff. The connection refuses to connect again until `disconnect`.
    pub fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::SeqCst);
        let _ = self.shared.stop.stop();
    }

    /// Tear the association down. A no-op on an idle connection.
    pub fn disconnect(&self) -> Result<()> {
        self.shared.canceled.store(false, Ordering::SeqCst);
        let current = self.state();
        if current == TakionState::Idle {
            self.join_worker();
            return Ok(());
        }

        if current != TakionState::Error {
            self.shared.transition(TakionState::Disconnecting);
        }

        if let Some(sockets) = self.shared.current_sockets() {
            let notice = TakionMessage::control(ChunkType::Data, self.shared.local_tag, 0, Bytes::new())
                .with_flags(FLAG_DISCONNECT);
            if let Err(e) = self.shared.send_on(&sockets.control, &notice) {
                tracing::debug!("Failed to send disconnect notice: {}", e);
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.stop.stop();
        self.join_worker();

        self.shared.close_sockets();
        *self.shared.connected_at.lock() = None;
        self.shared.transition(TakionState::Idle);
        tracing::info!(peer = %self.shared.control_addr, "Takion disconnected");
        Ok(())
    }

    /// Raw send on the stream socket
    pub fn send_packet(&self, bytes: &[u8]) -> Result<()> {
        let sockets = self.connected_sockets()?;
        self.shared.send_raw(&sockets.stream, bytes)
    }

    /// Send a DATA chunk on both sockets
    pub fn send_data_chunk(&self, payload: &[u8]) -> Result<()> {
        let sockets = self.connected_sockets()?;
        let msg = TakionMessage::control(
            ChunkType::Data,
            self.remote_tag(),
            self.shared.next_sequence(),
            Bytes::copy_from_slice(payload),
        );
        let on_control = self.shared.send_on(&sockets.control, &msg);
        let on_stream = self.shared.send_on(&sockets.stream, &msg);
        match (on_control, on_stream) {
            (Err(e), Err(_)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Send controller input as a DATA chunk on the stream socket
    pub fn send_input(&self, payload: &[u8]) -> Result<()> {
        let sockets = self.connected_sockets()?;
        let key_pos = self.shared.input_key_pos.fetch_add(1, Ordering::SeqCst);
        let msg = TakionMessage::control(ChunkType::Data, self.shared.local_tag, key_pos, Bytes::copy_from_slice(payload));
        self.shared.send_on(&sockets.stream, &msg)
    }

    /// Congestion feedback: current state
    pub fn send_feedback_state(&self, payload: &[u8]) -> Result<()> {
        self.send_feedback(ChunkType::FeedbackState, payload)
    }

    /// Congestion feedback: history
    pub fn send_feedback_history(&self, payload: &[u8]) -> Result<()> {
        self.send_feedback(ChunkType::FeedbackHistory, payload)
    }

    fn send_feedback(&self, chunk_type: ChunkType, payload: &[u8]) -> Result<()> {
        let sockets = self.connected_sockets()?;
        let msg = TakionMessage::control(
            chunk_type,
            self.remote_tag(),
            self.shared.next_sequence(),
            Bytes::copy_from_slice(payload),
        );
        self.shared.send_on(&sockets.stream, &msg)
    }

    fn connected_sockets(&self) -> Result<Arc<Sockets>> {
        if self.state() != TakionState::Connected {
            return Err(Error::NotConnected);
        }
        self.shared.current_sockets().ok_or(Error::NotConnected)
    }
}

impl Drop for TakionConnection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            tracing::debug!("Takion disconnect on drop failed: {}", e);
        }
    }
}

impl Shared {
    fn transition(&self, next: TakionState) -> bool {
        let old = {
            let mut state = self.state.lock();
            if *state == next {
                return true;
            }
            if !state.can_transition_to(next) {
                tracing::warn!("Rejected Takion transition {} -> {}", *state, next);
                return false;
            }
            std::mem::replace(&mut *state, next)
        };

        tracing::debug!("Takion state {} -> {}", old, next);
        if let Some(listener) = self.listener.upgrade() {
            listener.on_state_changed(old, next);
        }
        true
    }

    fn current_state(&self) -> TakionState {
        *self.state.lock()
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn current_sockets(&self) -> Option<Arc<Sockets>> {
        self.sockets.read().clone()
    }

    fn close_sockets(&self) {
        self.sockets.write().take();
    }

    fn open_socket(&self, peer: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(self.config.a_rwnd as usize)?;
        socket.set_send_buffer_size(self.config.send_buffer)?;
        socket.set_read_timeout(Some(Duration::from_millis(self.config.recv_timeout_ms)))?;
        socket.set_write_timeout(Some(Duration::from_millis(self.config.send_timeout_ms)))?;
        socket.connect(&peer.into())?;
        Ok(socket.into())
    }

    fn open_sockets(&self) -> Result<Arc<Sockets>> {
        let setup = |peer: SocketAddr| {
            self.open_socket(peer)
                .map_err(|e| NetworkError::SocketSetup(format!("{peer}: {e}")))
        };
        let sockets = Arc::new(Sockets {
            control: setup(self.control_addr)?,
            stream: setup(self.stream_addr)?,
        });

        let stale = self.drain_stale(&sockets.control) + self.drain_stale(&sockets.stream);
        if stale > 0 {
            tracing::debug!(datagrams = stale, "Drained stale datagrams after connect");
        }

        *self.sockets.write() = Some(sockets.clone());
        Ok(sockets)
    }

    /// Discard datagrams already queued in the kernel buffer
    fn drain_stale(&self, socket: &UdpSocket) -> usize {
        let deadline = Instant::now() + Duration::from_millis(self.config.drain_window_ms);
        let poll = Duration::from_millis(self.config.drain_poll_ms);
        let mut scratch = [0u8; 2048];
        let mut drained = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.stop.select_single(socket.as_raw_fd(), false, Some(poll.min(remaining))) {
                SelectResult::Ready => match socket.recv(&mut scratch) {
                    Ok(_) => drained += 1,
                    Err(_) => break,
                },
                _ => break,
            }
        }
        drained
    }

    /// One-byte probe; failure to send at all is fatal
    fn probe_reachability(&self, sockets: &Sockets) -> Result<()> {
        sockets.control.send(&[0u8]).map_err(|e| {
            tracing::error!(peer = %self.control_addr, "Peer unreachable: {}", e);
            NetworkError::HostUnreachable(format!("{}: {e}", self.control_addr))
        })?;
        Ok(())
    }

    fn send_raw(&self, socket: &UdpSocket, bytes: &[u8]) -> Result<()> {
        let sent = socket
            .send(bytes)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(())
    }

    fn send_on(&self, socket: &UdpSocket, msg: &TakionMessage) -> Result<()> {
        let bytes = msg.encode()?;
        self.send_raw(socket, &bytes)
    }

    fn handshake(&self, sockets: &Sockets) -> Result<()> {
        let init = InitChunk {
            tag: self.local_tag,
            a_rwnd: self.config.a_rwnd,
            outbound_streams: self.config.outbound_streams,
            inbound_streams: self.config.inbound_streams,
            initial_seq: self.local_tag,
        };
        self.send_on(&sockets.control, &init.to_message())?;
        self.transition(TakionState::InitSent);

        let msg = self.recv_handshake(&sockets.control)?;
        if msg.chunk_type != ChunkType::InitAck {
            return Err(ProtocolError::UnexpectedChunk {
                expected: ChunkType::InitAck.into(),
                actual: msg.chunk_type.into(),
            }
            .into());
        }
        let ack = InitAckChunk::from_payload(&msg.payload)?;
        self.remote_tag.store(ack.tag, Ordering::SeqCst);
        self.transition(TakionState::InitAckReceived);

        let cookie = CookieChunk { cookie: ack.cookie };
        self.send_on(&sockets.control, &cookie.to_message(ack.tag))?;
        self.transition(TakionState::CookieSent);

        loop {
            let msg = self.recv_handshake(&sockets.control)?;
            match msg.chunk_type {
                ChunkType::CookieAck => break,
                // Some peers repeat INIT-ACK before the COOKIE-ACK
                ChunkType::InitAck => {
                    tracing::debug!("Duplicate INIT-ACK during handshake, reading again");
                }
                other => {
                    return Err(ProtocolError::UnexpectedChunk {
                        expected: ChunkType::CookieAck.into(),
                        actual: other.into(),
                    }
                    .into())
                }
            }
        }

        self.transition(TakionState::CookieAckReceived);
        self.transition(TakionState::Connected);
        Ok(())
    }

    /// Receive the next control message within the handshake timeout.
    /// Datagrams that do not parse are counted and skipped.
    fn recv_handshake(&self, socket: &UdpSocket) -> Result<TakionMessage> {
        let deadline = Instant::now() + Duration::from_millis(self.config.handshake_timeout_ms);
        let mut buf = [0u8; 2048];

        loop {
            if self.peer_silent_too_long() {
                self.transition(TakionState::Error);
                return Err(Error::Timeout("no valid packet from peer during handshake".into()));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("handshake receive from {}", self.control_addr)));
            }

            match self.stop.select_single(socket.as_raw_fd(), false, Some(remaining)) {
                SelectResult::Ready => {}
                SelectResult::Timeout => continue,
                SelectResult::Canceled => return Err(NetworkError::Canceled.into()),
                SelectResult::Error(e) => return Err(NetworkError::ReceiveFailed(e.to_string()).into()),
            }

            let n = match socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    return Err(NetworkError::Refused(self.control_addr.to_string()).into())
                }
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string()).into()),
            };

            match TakionMessage::decode(&buf[..n]) {
                Ok(msg) if msg.packet_type == PacketType::Control => {
                    self.last_packet_ms.store(monotonic_ms(), Ordering::SeqCst);
                    return Ok(msg);
                }
                Ok(msg) => {
                    self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Ignoring {:?} packet during handshake", msg.packet_type);
                }
                Err(e) => {
                    self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(len = n, "Ignoring malformed datagram during handshake: {}", e);
                }
            }
        }
    }

    /// Restart the silence clock for a fresh handshake attempt
    fn begin_attempt(&self) {
        self.connect_started_ms.store(monotonic_ms(), Ordering::SeqCst);
        self.last_packet_ms.store(0, Ordering::SeqCst);
        self.timeout_logged.store(false, Ordering::SeqCst);
    }

    fn peer_silent_too_long(&self) -> bool {
        let since = self
            .last_packet_ms
            .load(Ordering::SeqCst)
            .max(self.connect_started_ms.load(Ordering::SeqCst));
        let silent = monotonic_ms().saturating_sub(since) > self.config.timeout_ms;
        if silent && !self.timeout_logged.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                peer = %self.control_addr,
                timeout_ms = self.config.timeout_ms,
                "No packet from peer within timeout"
            );
        }
        silent
    }

    fn receive_loop(self: Arc<Self>, sockets: Arc<Sockets>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let control_fd = sockets.control.as_raw_fd();
        let stream_fd = sockets.stream.as_raw_fd();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        tracing::debug!("Takion receive loop started");
        while self.running.load(Ordering::SeqCst) {
            match self.stop.select_either(control_fd, stream_fd, Some(poll)) {
                EitherResult::A => self.receive_one(&sockets.control, &mut buf),
                EitherResult::B => self.receive_one(&sockets.stream, &mut buf),
                EitherResult::Both => {
                    self.receive_one(&sockets.control, &mut buf);
                    self.receive_one(&sockets.stream, &mut buf);
                }
                EitherResult::Timeout => {
                    if self.current_state().is_handshaking() && self.peer_silent_too_long() {
                        self.transition(TakionState::Error);
                        break;
                    }
                }
                EitherResult::Canceled => break,
                EitherResult::Error(e) => {
                    tracing::error!("Takion select failed: {}", e);
                    self.transition(TakionState::Error);
                    break;
                }
            }
        }
        tracing::debug!("Takion receive loop exited");
    }

    fn receive_one(&self, socket: &UdpSocket, buf: &mut [u8]) {
        match socket.recv(buf) {
            Ok(n) => self.handle_datagram(&buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::debug!("Peer port unreachable: {}", e);
            }
            Err(e) => tracing::warn!("Takion receive error: {}", e),
        }
    }

    fn handle_datagram(&self, datagram: &[u8]) {
        let Some(&first) = datagram.first() else {
            return;
        };
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(datagram.len() as u64, Ordering::Relaxed);

        match PacketType::from(first) {
            PacketType::Control => match TakionMessage::decode(datagram) {
                Ok(msg) => {
                    self.last_packet_ms.store(monotonic_ms(), Ordering::SeqCst);
                    self.dispatch(msg);
                }
                Err(e) => {
                    self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(len = datagram.len(), "Dropping malformed control packet: {}", e);
                }
            },
            PacketType::Video => self.deliver(DataKind::Video, Bytes::copy_from_slice(&datagram[1..])),
            PacketType::Audio => self.deliver(DataKind::Audio, Bytes::copy_from_slice(&datagram[1..])),
            PacketType::Unknown(t) => {
                tracing::debug!("Dropping packet of unknown type {:#04x}", t);
            }
        }
    }

    fn dispatch(&self, msg: TakionMessage) {
        match msg.chunk_type {
            ChunkType::InitAck => {
                tracing::debug!("Ignoring INIT-ACK after handshake");
            }
            ChunkType::CookieAck => {
                if self.current_state() == TakionState::CookieSent {
                    self.transition(TakionState::CookieAckReceived);
                }
            }
            ChunkType::Data if msg.chunk_flags & FLAG_DISCONNECT != 0 && msg.payload.is_empty() => {
                self.close_by_peer();
            }
            ChunkType::Data => {
                let kind = classify_payload(&msg.payload);
                self.deliver(kind, msg.payload);
            }
            other => {
                tracing::debug!("Dropping chunk {:?}", other);
            }
        }
    }

    /// Peer ended the association. Runs on the network worker, which exits
    /// once `running` is cleared; the handle is joined by the next
    /// `connect` or `disconnect`.
    fn close_by_peer(&self) {
        tracing::info!(peer = %self.control_addr, "Peer sent disconnect");
        if !self.transition(TakionState::Disconnecting) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.close_sockets();
        *self.connected_at.lock() = None;
        self.transition(TakionState::Idle);
    }

    fn deliver(&self, kind: DataKind, payload: Bytes) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_data(kind, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullListener;

    impl TakionListener for NullListener {
        fn on_state_changed(&self, _old: TakionState, _new: TakionState) {}
        fn on_data(&self, _kind: DataKind, _payload: Bytes) {}
    }

    fn loopback() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[test]
    fn test_local_tag_nonzero() {
        let listener: Arc<dyn TakionListener> = Arc::new(NullListener);
        for _ in 0..32 {
            let conn = TakionConnection::new(loopback(), TakionConfig::default(), Arc::downgrade(&listener)).unwrap();
            assert_ne!(conn.local_tag(), 0);
            assert_eq!(conn.remote_tag(), 0);
            assert_eq!(conn.state(), TakionState::Idle);
        }
    }

    #[test]
    fn test_sends_require_connection() {
        let listener: Arc<dyn TakionListener> = Arc::new(NullListener);
        let conn = TakionConnection::new(loopback(), TakionConfig::default(), Arc::downgrade(&listener)).unwrap();
        assert!(matches!(conn.send_input(b"x"), Err(Error::NotConnected)));
        assert!(matches!(conn.send_data_chunk(b"x"), Err(Error::NotConnected)));
        assert!(matches!(conn.send_feedback_state(b"x"), Err(Error::NotConnected)));
        assert!(matches!(conn.send_packet(b"x"), Err(Error::NotConnected)));
    }

    #[test]
    fn test_disconnect_idle_is_noop() {
        let listener: Arc<dyn TakionListener> = Arc::new(NullListener);
        let conn = TakionConnection::new(loopback(), TakionConfig::default(), Arc::downgrade(&listener)).unwrap();
        assert!(conn.disconnect().is_ok());
        assert!(conn.disconnect().is_ok());
        assert_eq!(conn.state(), TakionState::Idle);
    }

    struct StateLog(Mutex<Vec<TakionState>>);

    impl TakionListener for StateLog {
        fn on_state_changed(&self, _old: TakionState, new: TakionState) {
            self.0.lock().push(new);
        }
        fn on_data(&self, _kind: DataKind, _payload: Bytes) {}
    }

    #[test]
    fn test_drop_after_failed_connect_returns_to_idle() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = TakionConfig {
            control_port: silent.local_addr().unwrap().port(),
            stream_port: silent.local_addr().unwrap().port(),
            handshake_timeout_ms: 50,
            drain_window_ms: 5,
            drain_poll_ms: 5,
            ..TakionConfig::default()
        };
        let log = Arc::new(StateLog(Mutex::new(Vec::new())));
        let listener: Arc<dyn TakionListener> = log.clone();
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let conn = TakionConnection::new(loopback(), config, Arc::downgrade(&listener))
            .unwrap()
            .with_handshake_policy(policy);

        assert!(conn.connect().is_err());
        assert_eq!(conn.state(), TakionState::Error);
        drop(conn);
        assert_eq!(log.0.lock().last(), Some(&TakionState::Idle));
    }

    #[test]
    fn test_cancel_before_connect_is_sticky_until_disconnect() {
        let listener: Arc<dyn TakionListener> = Arc::new(NullListener);
        let conn = TakionConnection::new(loopback(), TakionConfig::default(), Arc::downgrade(&listener)).unwrap();
        conn.cancel();
        assert!(matches!(conn.connect(), Err(Error::Network(NetworkError::Canceled))));
        assert_eq!(conn.state(), TakionState::Idle);
        conn.disconnect().unwrap();
        assert!(!conn.shared.canceled.load(Ordering::SeqCst));
    }
}
