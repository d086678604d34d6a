//! In-memory engine and transport doubles that record every call.
//!
//! Handlers are invoked through explicit `emit_*` / `deliver` calls, or from
//! a background thread when a connection is set up to emit during
//! `set_local_description`; never synchronously inside a trait method.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::{MasterError, Result};
use crate::ice::IceServerConfig;
use crate::peer::{
    ConnectionStateHandler, EncodedFrame, IceCandidateInit, LocalCandidateHandler, NegotiationEngine,
    PeerConnection, PeerConnectionState, SessionDescription, TrackKind, Transceiver, TransceiverDirection,
};
use crate::signaling::{
    ChannelConfig, InboundMessage, OutboundMessage, SignalingCallbacks, SignalingMetrics, SignalingTransport,
};

const ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// A minimal offer payload as a viewer would send it
pub fn offer_json() -> String {
    r#"{"type":"offer","sdp":"v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-options:trickle\r\n"}"#
        .to_string()
}

pub struct MockTransceiver {
    kind: TrackKind,
    direction: TransceiverDirection,
    frames: Mutex<Vec<EncodedFrame>>,
    fail_writes: AtomicBool,
}

impl MockTransceiver {
    fn new(kind: TrackKind, direction: TransceiverDirection) -> Self {
        Self {
            kind,
            direction,
            frames: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn frames(&self) -> Vec<EncodedFrame> {
        self.frames.lock().clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Transceiver for MockTransceiver {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn direction(&self) -> TransceiverDirection {
        self.direction
    }

    fn write_frame(&self, frame: &EncodedFrame) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MasterError::NegotiationEngine("write refused".to_string()));
        }
        self.frames.lock().push(frame.clone());
        Ok(())
    }
}

pub struct MockPeerConnection {
    ice_servers: Vec<IceServerConfig>,
    trickle: Option<bool>,
    fail_remote_description: bool,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    gathered: Mutex<Vec<IceCandidateInit>>,
    remote_candidates: Mutex<Vec<IceCandidateInit>>,
    transceivers: Mutex<Vec<Arc<MockTransceiver>>>,
    on_candidate: Mutex<Option<Arc<dyn Fn(Option<IceCandidateInit>) + Send + Sync>>>,
    on_state: Mutex<Option<Arc<dyn Fn(PeerConnectionState) + Send + Sync>>>,
    closed: AtomicBool,
    emit_on_local_description: Option<IceCandidateInit>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl MockPeerConnection {
    /// Wait for candidates emitted from background threads.
    pub fn join_background(&self) {
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        self.ice_servers.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidateInit> {
        self.remote_candidates.lock().clone()
    }

    fn transceiver(&self, kind: TrackKind) -> Arc<MockTransceiver> {
        self.transceivers
            .lock()
            .iter()
            .find(|t| t.kind == kind)
            .cloned()
            .expect("transceiver not created")
    }

    pub fn video(&self) -> Arc<MockTransceiver> {
        self.transceiver(TrackKind::Video)
    }

    pub fn audio(&self) -> Arc<MockTransceiver> {
        self.transceiver(TrackKind::Audio)
    }

    /// Report a gathered candidate, or end of gathering with `None`.
    pub fn emit_candidate(&self, candidate: Option<IceCandidateInit>) {
        if let Some(ref c) = candidate {
            self.gathered.lock().push(c.clone());
        }
        let handler = self.on_candidate.lock().clone();
        if let Some(h) = handler {
            h(candidate);
        }
    }

    pub fn emit_state(&self, state: PeerConnectionState) {
        let handler = self.on_state.lock().clone();
        if let Some(h) = handler {
            h(state);
        }
    }
}

impl PeerConnection for Arc<MockPeerConnection> {
    fn add_transceiver(&self, kind: TrackKind, direction: TransceiverDirection) -> Result<Arc<dyn Transceiver>> {
        let transceiver = Arc::new(MockTransceiver::new(kind, direction));
        self.transceivers.lock().push(transceiver.clone());
        Ok(transceiver)
    }

    fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        if self.fail_remote_description {
            return Err(MasterError::NegotiationEngine("remote description rejected".to_string()));
        }
        *self.remote.lock() = Some(desc.clone());
        Ok(())
    }

    fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(ANSWER_SDP))
    }

    fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        *self.local.lock() = Some(desc.clone());
        if let Some(candidate) = self.emit_on_local_description.clone() {
            let connection = self.clone();
            let handle = thread::spawn(move || connection.emit_candidate(Some(candidate)));
            self.background.lock().push(handle);
        }
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        let mut desc = self.local.lock().clone()?;
        for candidate in self.gathered.lock().iter() {
            desc.sdp.push_str(&format!("a={}\r\n", candidate.candidate));
        }
        Some(desc)
    }

    fn can_trickle_ice(&self) -> Option<bool> {
        self.remote.lock().as_ref()?;
        self.trickle
    }

    fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<()> {
        self.remote_candidates.lock().push(candidate.clone());
        Ok(())
    }

    fn on_local_candidate(&self, handler: LocalCandidateHandler) {
        *self.on_candidate.lock() = Some(Arc::from(handler));
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        *self.on_state.lock() = Some(Arc::from(handler));
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct EngineState {
    trickle: Mutex<Option<bool>>,
    fail_next_remote: AtomicBool,
    emit_on_local_description: Mutex<Option<IceCandidateInit>>,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
}

/// Engine double; clones share state
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<EngineState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState {
                trickle: Mutex::new(Some(true)),
                fail_next_remote: AtomicBool::new(false),
                emit_on_local_description: Mutex::new(None),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_trickle(self, trickle: bool) -> Self {
        self.set_trickle(Some(trickle));
        self
    }

    /// Trickle support reported by connections created from now on
    pub fn set_trickle(&self, trickle: Option<bool>) {
        *self.state.trickle.lock() = trickle;
    }

    pub fn fail_next_remote_description(&self) {
        self.state.fail_next_remote.store(true, Ordering::SeqCst);
    }

    /// Connections created from now on gather `candidate` on another thread
    /// as soon as their local description is set.
    pub fn emit_during_local_description(&self, candidate: IceCandidateInit) {
        *self.state.emit_on_local_description.lock() = Some(candidate);
    }

    pub fn connections_created(&self) -> usize {
        self.state.connections.lock().len()
    }

    pub fn closed_count(&self) -> usize {
        self.state.connections.lock().iter().filter(|c| c.is_closed()).count()
    }

    pub fn last_connection(&self) -> Option<Arc<MockPeerConnection>> {
        self.state.connections.lock().last().cloned()
    }
}

impl NegotiationEngine for MockEngine {
    fn create_peer_connection(&self, ice_servers: &[IceServerConfig]) -> Result<Box<dyn PeerConnection>> {
        let connection = Arc::new(MockPeerConnection {
            ice_servers: ice_servers.to_vec(),
            trickle: *self.state.trickle.lock(),
            fail_remote_description: self.state.fail_next_remote.swap(false, Ordering::SeqCst),
            remote: Mutex::new(None),
            local: Mutex::new(None),
            gathered: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            transceivers: Mutex::new(Vec::new()),
            on_candidate: Mutex::new(None),
            on_state: Mutex::new(None),
            closed: AtomicBool::new(false),
            emit_on_local_description: self.state.emit_on_local_description.lock().clone(),
            background: Mutex::new(Vec::new()),
        });
        self.state.connections.lock().push(connection.clone());
        Ok(Box::new(connection))
    }
}

struct TransportState {
    channel: Mutex<ChannelConfig>,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    callbacks: Mutex<Option<Arc<SignalingCallbacks>>>,
    fail_sends: AtomicBool,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

/// Transport double; clones share state so a factory can hand out copies
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TransportState {
                channel: Mutex::new(ChannelConfig {
                    channel_name: "mock-channel".to_string(),
                    ice_servers: Vec::new(),
                }),
                sent: Arc::new(Mutex::new(Vec::new())),
                callbacks: Mutex::new(None),
                fail_sends: AtomicBool::new(false),
                fail_connect: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_channel(self, channel: ChannelConfig) -> Self {
        *self.state.channel.lock() = channel;
        self
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state.sent.lock().clone()
    }

    pub fn sent_log(&self) -> Arc<Mutex<Vec<OutboundMessage>>> {
        self.state.sent.clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    fn callbacks(&self) -> Option<Arc<SignalingCallbacks>> {
        self.state.callbacks.lock().clone()
    }

    /// Deliver an inbound message as the service would.
    pub fn deliver(&self, message: InboundMessage) {
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_message)(message);
        }
    }

    pub fn report_error(&self, code: u32, message: &str) {
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_error)(code, message);
        }
    }
}

impl SignalingTransport for MockTransport {
    fn fetch_channel_config(&mut self) -> Result<ChannelConfig> {
        Ok(self.state.channel.lock().clone())
    }

    fn connect(&mut self, callbacks: SignalingCallbacks) -> Result<()> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(MasterError::Transport("connect refused".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        *self.state.callbacks.lock() = Some(Arc::new(callbacks));
        Ok(())
    }

    fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(MasterError::TransportSend("send refused".to_string()));
        }
        self.state.sent.lock().push(message.clone());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn metrics(&self) -> SignalingMetrics {
        SignalingMetrics {
            messages_sent: self.state.sent.lock().len() as u64,
            ..Default::default()
        }
    }
}
