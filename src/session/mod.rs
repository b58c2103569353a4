//! Streaming session orchestration
//!
//! A [`Session`] owns one console connection end to end: media pipelines,
//! HTTP session init, control plane, keepalive and the Takion transport.
//! The transport, control plane and keepalive report back through weak
//! listener handles, so the session holds the only strong references to
//! its collaborators.
//!
//! Bring-up order is renderer, video decoder, audio, performance monitor,
//! session init, control plane, keepalive, Takion. Teardown runs keepalive,
//! control plane, transport, decoders, renderer, then releases the network.

pub mod events;
pub mod init;
pub mod input;

pub use events::{SessionEvents, SessionState};
pub use init::{CredentialStore, SessionGrant, SessionInit, StaticCredentials};
pub use input::{ControllerInput, InputMapping, PadState};

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

use crate::config::{AppConfig, Settings};
use crate::control::{ControlListener, ControlPlane};
use crate::error::{Error, ErrorKind, NetworkError, Result};
use crate::keepalive::{Keepalive, KeepaliveListener, KeepaliveStats, KeepaliveStatus};
use crate::media::{
    AudioDecoder, AudioPipeline, AudioSink, AudioStats, AvReceiver, PacketStats, PerformanceMonitor,
    PerformanceSample, PerformanceSnapshot, VideoDecoder, VideoPipeline, VideoRenderer, VideoStats,
};
use crate::network::{NetworkLease, NetworkManager};
use crate::platform::StopPipe;
use crate::retry::{self, CancelableClock, RetryPolicy};
use crate::takion::{DataKind, TakionConnection, TakionListener, TakionState, TakionStats};

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub id: Uuid,
    pub state: SessionState,
    pub connected_for: Option<Duration>,
    pub transport: Option<TakionStats>,
    pub packets: PacketStats,
    pub video: Option<VideoStats>,
    pub audio: Option<AudioStats>,
    pub keepalive: Option<KeepaliveStats>,
    pub performance: Option<PerformanceSnapshot>,
    pub server_version: Option<String>,
}

/// Components alive while a session is up
#[derive(Default)]
struct Components {
    lease: Option<NetworkLease>,
    monitor: Option<PerformanceMonitor>,
    control: Option<ControlPlane>,
    keepalive: Option<Keepalive>,
    takion: Option<Arc<TakionConnection>>,
    grant: Option<SessionGrant>,
}

/// Blocking steps of an in-flight `connect` that `cancel` must reach
#[derive(Default)]
struct Pending {
    init: Option<Arc<SessionInit>>,
    takion: Option<Arc<TakionConnection>>,
}

impl Components {
    fn is_empty(&self) -> bool {
        self.lease.is_none()
            && self.monitor.is_none()
            && self.control.is_none()
            && self.keepalive.is_none()
            && self.takion.is_none()
    }

    /// Fixed destruction order
    fn tear_down(&mut self, video: Option<&VideoPipeline>, audio: Option<&AudioPipeline>) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        if let Some(control) = self.control.take() {
            control.stop();
        }
        if let Some(takion) = self.takion.take() {
            if let Err(e) = takion.disconnect() {
                tracing::warn!("Transport disconnect failed: {}", e);
            }
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(video) = video {
            video.stop_decoder();
        }
        if let Some(audio) = audio {
            audio.stop();
        }
        if let Some(video) = video {
            video.stop_renderer();
        }
        self.grant = None;
        self.lease = None;
    }
}

struct Inner {
    id: Uuid,
    peer: IpAddr,
    request_port: u16,
    config: AppConfig,
    mapping: InputMapping,
    credentials: Arc<dyn CredentialStore>,
    network: NetworkManager,
    events: Option<Arc<dyn SessionEvents>>,
    init_policy: RetryPolicy,

    state: Mutex<SessionState>,
    /// Set while `connect` runs; transport errors are reported by `connect` itself
    connecting: AtomicBool,
    video: Option<Arc<VideoPipeline>>,
    audio: Option<Arc<AudioPipeline>>,
    receiver: AvReceiver,
    components: Mutex<Components>,
    /// Serializes connect and disconnect
    op_lock: Mutex<()>,
    cancel: StopPipe,
    pending: Mutex<Pending>,
}

/// One remote play session against a single console
pub struct Session {
    inner: Arc<Inner>,
}

/// Collaborators and parameters for a [`Session`]
pub struct SessionBuilder {
    peer: IpAddr,
    request_port: u16,
    credentials: Arc<dyn CredentialStore>,
    config: AppConfig,
    settings: Settings,
    network: Option<NetworkManager>,
    events: Option<Arc<dyn SessionEvents>>,
    video: Option<(Box<dyn VideoDecoder>, Box<dyn VideoRenderer>)>,
    audio: Option<(Option<Box<dyn AudioDecoder>>, Box<dyn AudioSink>)>,
    init_policy: RetryPolicy,
}

impl SessionBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Port of the console's session-init endpoint
    pub fn request_port(mut self, port: u16) -> Self {
        self.request_port = port;
        self
    }

    pub fn network(mut self, network: NetworkManager) -> Self {
        self.network = Some(network);
        self
    }

    pub fn events(mut self, events: Arc<dyn SessionEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn video(mut self, decoder: Box<dyn VideoDecoder>, renderer: Box<dyn VideoRenderer>) -> Self {
        self.video = Some((decoder, renderer));
        self
    }

    /// `decoder = None` plays silence for every received packet
    pub fn audio(mut self, decoder: Option<Box<dyn AudioDecoder>>, sink: Box<dyn AudioSink>) -> Self {
        self.audio = Some((decoder, sink));
        self
    }

    pub fn init_policy(mut self, policy: RetryPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    pub fn build(self) -> Result<Session> {
        self.config.validate()?;
        let validation = self.settings.validate();
        if !validation.is_valid() {
            return Err(Error::InvalidParam(format!("settings: {validation:?}")));
        }

        let video = self
            .video
            .map(|(decoder, renderer)| Arc::new(VideoPipeline::new(self.config.video.clone(), decoder, renderer)));
        let audio = match self.audio {
            Some((decoder, sink)) => Some(Arc::new(AudioPipeline::new(self.config.audio.clone(), decoder, sink)?)),
            None => None,
        };
        let cancel = StopPipe::new().map_err(|e| NetworkError::SocketSetup(format!("stop pipe: {e}")))?;
        let network = self
            .network
            .unwrap_or_else(|| NetworkManager::new(self.config.network.clone()));

        let inner = Inner {
            id: Uuid::new_v4(),
            peer: self.peer,
            request_port: self.request_port,
            mapping: InputMapping::from_settings(&self.settings),
            config: self.config,
            credentials: self.credentials,
            network,
            events: self.events,
            init_policy: self.init_policy,
            state: Mutex::new(SessionState::Idle),
            connecting: AtomicBool::new(false),
            receiver: AvReceiver::new(video.clone(), audio.clone()),
            video,
            audio,
            components: Mutex::new(Components::default()),
            op_lock: Mutex::new(()),
            cancel,
            pending: Mutex::new(Pending::default()),
        };
        Ok(Session { inner: Arc::new(inner) })
    }
}

impl Session {
    pub fn builder(peer: IpAddr, credentials: Arc<dyn CredentialStore>) -> SessionBuilder {
        let config = AppConfig::default();
        SessionBuilder {
            peer,
            request_port: config.takion.control_port,
            credentials,
            config,
            settings: Settings::default(),
            network: None,
            events: None,
            video: None,
            audio: None,
            init_policy: RetryPolicy::session_init(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer(&self) -> IpAddr {
        self.inner.peer
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Bring every component up; on failure the ones already started are torn down
    pub fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();

        let current = self.state();
        if current.is_active() {
            return Err(Error::InvalidState(format!("session already {current}")));
        }

        // Leftovers from a transport that failed while streaming
        let mut stale = std::mem::take(&mut *inner.components.lock());
        stale.tear_down(inner.video.as_deref(), inner.audio.as_deref());

        inner.cancel.reset();
        inner.connecting.store(true, Ordering::SeqCst);
        tracing::info!(session = %inner.id, peer = %inner.peer, "Connecting session");

        let mut components = Components::default();
        let result = self.bring_up(&mut components);
        *inner.pending.lock() = Pending::default();
        inner.connecting.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                *inner.components.lock() = components;
                tracing::info!(session = %inner.id, "Session streaming");
                Ok(())
            }
            Err(e) => {
                tracing::error!(session = %inner.id, "Session connect failed: {}", e);
                components.tear_down(inner.video.as_deref(), inner.audio.as_deref());
                inner.set_state(SessionState::Error);
                inner.report_error(e.kind().code(), &e.to_string());
                Err(e)
            }
        }
    }

    fn bring_up(&self, components: &mut Components) -> Result<()> {
        let inner = &self.inner;
        let config = &inner.config;

        components.lease = Some(inner.network.acquire()?);
        if inner.network.is_offline() {
            return Err(Error::Offline);
        }

        if let Some(video) = &inner.video {
            video.start_renderer()?;
            video.start_decoder()?;
        }
        if let Some(audio) = &inner.audio {
            audio.start()?;
        }
        if config.monitor.enabled {
            match self.start_monitor() {
                Ok(monitor) => components.monitor = Some(monitor),
                Err(e) => tracing::warn!("Performance monitor unavailable: {}", e),
            }
        }

        let init = Arc::new(SessionInit::new(Duration::from_millis(config.control.connect_timeout_ms))?);
        inner.pending.lock().init = Some(init.clone());
        inner.check_canceled()?;
        let clock = CancelableClock { stop: &inner.cancel };
        let grant = retry::execute_with(&inner.init_policy, &clock, |ctx| {
            if ctx.attempt > 1 {
                tracing::info!(attempt = ctx.attempt, "Retrying session init");
            }
            init.request(inner.peer, inner.request_port, inner.credentials.as_ref(), config.takion.peer_class)
        })?;
        components.grant = Some(grant);

        if config.control.enabled {
            let listener: Weak<dyn ControlListener> = Arc::<Inner>::downgrade(&self.inner);
            let addr = SocketAddr::new(inner.peer, config.control.port);
            components.control = Some(ControlPlane::connect(addr, config.control.clone(), listener)?);
        }
        if config.keepalive.enabled {
            let listener: Weak<dyn KeepaliveListener> = Arc::<Inner>::downgrade(&self.inner);
            let addr = SocketAddr::new(inner.peer, config.keepalive.port);
            components.keepalive = Some(Keepalive::start(addr, config.keepalive.clone(), listener)?);
        }

        let listener: Weak<dyn TakionListener> = Arc::<Inner>::downgrade(&self.inner);
        let takion = Arc::new(TakionConnection::new(inner.peer, config.takion.clone(), listener)?);
        components.takion = Some(takion.clone());
        inner.pending.lock().takion = Some(takion.clone());
        inner.check_canceled()?;
        takion.connect()
    }

    fn start_monitor(&self) -> Result<PerformanceMonitor> {
        let weak = Arc::downgrade(&self.inner);
        let monitor = PerformanceMonitor::new(&self.inner.config.monitor, move || {
            weak.upgrade().map(|inner| inner.sample()).unwrap_or_default()
        })?;
        monitor.start()?;
        Ok(monitor)
    }

    /// Tear the session down. A no-op on an idle session with nothing left
    /// to release.
    pub fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();
        // A peer-initiated close leaves the session idle with its components still held
        if self.state() == SessionState::Idle && inner.components.lock().is_empty() {
            return Ok(());
        }

        tracing::info!(session = %inner.id, "Disconnecting session");
        let mut components = std::mem::take(&mut *inner.components.lock());
        components.tear_down(inner.video.as_deref(), inner.audio.as_deref());
        inner.set_state(SessionState::Idle);
        Ok(())
    }

    /// Interrupt a `connect` blocked in session init, the transport
    /// handshake, or a backoff between attempts. The interrupted `connect`
    /// returns `NetworkError::Canceled`.
    pub fn cancel(&self) {
        let inner = &self.inner;
        let _ = inner.cancel.stop();
        let pending = inner.pending.lock();
        if let Some(init) = &pending.init {
            init.cancel();
        }
        if let Some(takion) = &pending.takion {
            takion.cancel();
        }
    }

    /// Forward one controller report to the console
    pub fn send_input(&self, input: &ControllerInput) -> Result<()> {
        let takion = self.inner.components.lock().takion.clone().ok_or(Error::NotConnected)?;
        takion.send_input(&input.encode())
    }

    /// Translate a raw pad sample with the session's mapping and send it
    pub fn send_pad(&self, pad: &PadState) -> Result<()> {
        self.send_input(&ControllerInput::from_pad(pad, &self.inner.mapping))
    }

    pub fn stats(&self) -> SessionStats {
        let inner = &self.inner;
        let components = inner.components.lock();
        SessionStats {
            id: inner.id,
            state: self.state(),
            connected_for: components.takion.as_ref().and_then(|t| t.connected_for()),
            transport: components.takion.as_ref().map(|t| t.stats()),
            packets: inner.receiver.stats(),
            video: inner.video.as_ref().map(|v| v.stats()),
            audio: inner.audio.as_ref().map(|a| a.stats()),
            keepalive: components.keepalive.as_ref().map(|k| k.stats()),
            performance: components.monitor.as_ref().and_then(|m| m.latest()),
            server_version: components.control.as_ref().and_then(|c| c.server_version()),
        }
    }

    /// Grant returned by the console's session-init endpoint
    pub fn grant(&self) -> Option<SessionGrant> {
        self.inner.components.lock().grant.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

impl Inner {
    fn set_state(&self, new: SessionState) {
        let old = {
            let mut state = self.state.lock();
            if *state == new {
                return;
            }
            std::mem::replace(&mut *state, new)
        };
        tracing::debug!(session = %self.id, "Session state {} -> {}", old, new);
        if let Some(events) = &self.events {
            events.on_state_changed(old, new);
        }
    }

    fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_stopped() {
            return Err(NetworkError::Canceled.into());
        }
        Ok(())
    }

    fn report_error(&self, code: i32, message: &str) {
        if let Some(events) = &self.events {
            events.on_error(code, message);
        }
    }

    fn sample(&self) -> PerformanceSample {
        let video = self.video.as_ref().map(|v| v.stats()).unwrap_or_default();
        let audio = self.audio.as_ref().map(|a| a.stats()).unwrap_or_default();
        let keepalive_rtt_ms = self
            .components
            .try_lock()
            .and_then(|c| c.keepalive.as_ref().and_then(|k| k.stats().average_rtt_ms));
        PerformanceSample {
            bytes_received: self.receiver.stats().total_bytes(),
            video_frames_decoded: video.frames_decoded,
            audio_frames_decoded: audio.frames_decoded,
            frames_dropped: video.frames_dropped + audio.frames_dropped,
            keepalive_rtt_ms,
        }
    }
}

impl TakionListener for Inner {
    fn on_state_changed(&self, old: TakionState, new: TakionState) {
        tracing::debug!(session = %self.id, "Transport {} -> {}", old, new);
        self.set_state(SessionState::from(new));
        if new == TakionState::Error && !self.connecting.load(Ordering::SeqCst) {
            self.report_error(ErrorKind::Network.code(), "transport failed");
        }
    }

    fn on_data(&self, kind: DataKind, payload: Bytes) {
        self.receiver.handle(kind, payload);
    }
}

impl ControlListener for Inner {
    fn on_version(&self, version: &str) {
        tracing::info!(session = %self.id, version, "Console version");
        if let Some(events) = &self.events {
            events.on_version(version);
        }
    }

    fn on_error(&self, code: u8, message: &str) {
        tracing::warn!(session = %self.id, code, "Console reported error: {}", message);
        self.report_error(code as i32, message);
    }

    fn on_connection_lost(&self) {
        tracing::warn!(session = %self.id, "Control plane lost");
        self.report_error(ErrorKind::Network.code(), "control plane connection lost");
    }
}

impl KeepaliveListener for Inner {
    fn on_status_changed(&self, status: KeepaliveStatus) {
        if status == KeepaliveStatus::Failed {
            tracing::warn!(session = %self.id, "Keepalive failed");
            self.report_error(ErrorKind::Timeout.code(), "keepalive failed");
        }
    }
}
