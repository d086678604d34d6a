//! Per-viewer session and its negotiation state machine.
//!
//! A [`Session`] owns one peer connection with a send-only video transceiver
//! and a send-receive audio transceiver. [`SessionBuilder::build`] returns a
//! session that has applied the viewer's offer and produced its answer, or an
//! error with the peer connection already closed.
//!
//! Negotiation branches on the viewer's trickle ICE support:
//! - trickle: the answer goes out right after the local description is set,
//!   then every local candidate is sent on its own;
//! - no trickle: candidates are not sent; once gathering completes the
//!   current local description (now carrying every candidate) is sent as the
//!   one and only answer.

pub mod manager;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{MasterError, Result};
use crate::ice::IceServerConfig;
use crate::peer::{
    IceCandidateInit, NegotiationEngine, PeerConnection, PeerConnectionState, SdpType, SessionDescription,
    TrackKind, Transceiver, TransceiverDirection,
};
use crate::signaling::SignalingSender;

pub use manager::SessionManager;

/// Negotiation progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    RemoteDescriptionSet,
    /// Trickle: answer sent, candidates follow one by one
    AnswerSentEarly,
    /// No trickle: waiting for gathering to finish before answering
    AwaitingCandidateGathering,
    AnswerSent,
    Connected,
    Terminated,
}

/// Connection-state change as seen by the session owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Connected,
    /// First terminal transition of the session
    Terminated,
    Other(PeerConnectionState),
}

/// Receives connection-state changes of every session.
pub trait SessionObserver: Send + Sync {
    fn on_session_state(&self, peer_id: &str, change: StateChange);
}

struct Negotiation {
    state: NegotiationState,
    remote_can_trickle_ice: Option<bool>,
    candidate_gathering_done: bool,
    local_answer: Option<SessionDescription>,
    answer_sent: bool,
}

impl Negotiation {
    fn new() -> Self {
        Self {
            state: NegotiationState::Created,
            remote_can_trickle_ice: None,
            candidate_gathering_done: false,
            local_answer: None,
            answer_sent: false,
        }
    }
}

/// One viewer's session
pub struct Session {
    peer_id: String,
    peer_connection: Box<dyn PeerConnection>,
    video_transceiver: Arc<dyn Transceiver>,
    audio_transceiver: Arc<dyn Transceiver>,
    terminated: AtomicBool,
    frame_index: AtomicU64,
    negotiation: Mutex<Negotiation>,
    created_at: Instant,
}

impl Session {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Mark the session terminated. Returns true on the first call only.
    pub fn mark_terminated(&self) -> bool {
        let first = !self.terminated.swap(true, Ordering::SeqCst);
        if first {
            self.negotiation.lock().state = NegotiationState::Terminated;
        }
        first
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.lock().state
    }

    pub fn remote_can_trickle_ice(&self) -> Option<bool> {
        self.negotiation.lock().remote_can_trickle_ice
    }

    pub fn candidate_gathering_done(&self) -> bool {
        self.negotiation.lock().candidate_gathering_done
    }

    pub fn local_answer(&self) -> Option<SessionDescription> {
        self.negotiation.lock().local_answer.clone()
    }

    /// Frames written to this session so far
    pub fn frame_index(&self) -> u64 {
        self.frame_index.load(Ordering::SeqCst)
    }

    pub(crate) fn next_frame_index(&self) -> u64 {
        self.frame_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn transceiver(&self, kind: TrackKind) -> &Arc<dyn Transceiver> {
        match kind {
            TrackKind::Video => &self.video_transceiver,
            TrackKind::Audio => &self.audio_transceiver,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Apply the viewer's offer and produce (and, with trickle, send) the answer.
    ///
    /// Holds the negotiation lock throughout, so candidate callbacks fired
    /// by the engine meanwhile wait and are sent after the answer.
    fn negotiate(&self, offer: &SessionDescription, sender: &SignalingSender) -> Result<()> {
        let mut neg = self.negotiation.lock();

        self.peer_connection.set_remote_description(offer)?;
        neg.state = NegotiationState::RemoteDescriptionSet;

        let trickle = self.peer_connection.can_trickle_ice().ok_or_else(|| {
            MasterError::NegotiationEngine(format!(
                "Trickle ICE support unknown after remote description for '{}'",
                self.peer_id
            ))
        })?;
        neg.remote_can_trickle_ice = Some(trickle);

        let answer = self.peer_connection.create_answer()?;
        self.peer_connection.set_local_description(&answer)?;

        if !trickle {
            log::debug!("[Session] '{}' waiting for candidate gathering before answering", self.peer_id);
            neg.local_answer = Some(answer);
            neg.state = NegotiationState::AwaitingCandidateGathering;
            return Ok(());
        }

        let answer = self.peer_connection.local_description().unwrap_or(answer);
        sender.send_answer(&self.peer_id, &answer)?;
        neg.local_answer = Some(answer);
        neg.answer_sent = true;
        neg.state = NegotiationState::AnswerSentEarly;
        log::debug!("[Session] '{}' answer sent early (trickle)", self.peer_id);

        if neg.candidate_gathering_done {
            neg.state = NegotiationState::AnswerSent;
        }

        Ok(())
    }

    /// Engine reported a local candidate, or end of gathering (`None`).
    pub(crate) fn handle_local_candidate(&self, candidate: Option<IceCandidateInit>, sender: &SignalingSender) {
        if self.is_terminated() {
            return;
        }
        let mut neg = self.negotiation.lock();

        match candidate {
            Some(candidate) => {
                if neg.remote_can_trickle_ice != Some(true) {
                    // Carried by the final answer instead
                    return;
                }
                if !neg.answer_sent {
                    // Early answer failed; the session is being torn down
                    return;
                }
                if let Err(e) = sender.send_ice_candidate(&self.peer_id, &candidate) {
                    log::warn!("[Session] '{}' failed to send candidate: {}", self.peer_id, e);
                }
            }
            None => {
                if neg.candidate_gathering_done {
                    return;
                }
                neg.candidate_gathering_done = true;
                log::debug!("[Session] '{}' candidate gathering done", self.peer_id);

                match neg.remote_can_trickle_ice {
                    Some(false) if !neg.answer_sent => {
                        let answer = match self.peer_connection.local_description() {
                            Some(desc) => desc,
                            None => match neg.local_answer.clone() {
                                Some(desc) => desc,
                                None => {
                                    log::error!("[Session] '{}' has no local description to answer with", self.peer_id);
                                    return;
                                }
                            },
                        };
                        match sender.send_answer(&self.peer_id, &answer) {
                            Ok(()) => {
                                neg.answer_sent = true;
                                neg.state = NegotiationState::AnswerSent;
                                log::debug!("[Session] '{}' answer sent after gathering", self.peer_id);
                            }
                            Err(e) => log::error!("[Session] '{}' failed to send answer: {}", self.peer_id, e),
                        }
                        neg.local_answer = Some(answer);
                    }
                    Some(true) if neg.answer_sent => {
                        neg.state = NegotiationState::AnswerSent;
                    }
                    _ => {}
                }
            }
        }
    }

    /// Engine reported a connection-state transition.
    pub(crate) fn handle_connection_state(&self, state: PeerConnectionState) -> Option<StateChange> {
        log::info!("[Session] '{}' connection state: {:?}", self.peer_id, state);
        match state {
            PeerConnectionState::Connected => {
                if self.is_terminated() {
                    return None;
                }
                self.negotiation.lock().state = NegotiationState::Connected;
                Some(StateChange::Connected)
            }
            s if s.is_terminal() => {
                if self.mark_terminated() {
                    Some(StateChange::Terminated)
                } else {
                    None
                }
            }
            other => Some(StateChange::Other(other)),
        }
    }

    /// Apply a remote candidate, whatever the negotiation state.
    pub fn add_remote_candidate(&self, payload: &str) -> Result<()> {
        let candidate = IceCandidateInit::from_json(payload)?;
        self.peer_connection.add_ice_candidate(&candidate)
    }

    pub fn close(&self) {
        if let Err(e) = self.peer_connection.close() {
            log::warn!("[Session] '{}' close failed: {}", self.peer_id, e);
        }
    }
}

/// Closes a peer connection on drop unless disarmed
struct PeerGuard<'a> {
    peer_connection: &'a dyn PeerConnection,
    armed: bool,
}

impl<'a> PeerGuard<'a> {
    fn new(peer_connection: &'a dyn PeerConnection) -> Self {
        Self {
            peer_connection,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PeerGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.peer_connection.close() {
                log::warn!("[Session] Failed to close abandoned peer connection: {}", e);
            }
        }
    }
}

/// Builds a negotiated [`Session`] from a viewer's offer.
pub struct SessionBuilder<'a> {
    peer_id: String,
    engine: &'a dyn NegotiationEngine,
    sender: Arc<SignalingSender>,
    ice_servers: Vec<IceServerConfig>,
    observer: Option<Weak<dyn SessionObserver>>,
}

impl<'a> SessionBuilder<'a> {
    pub fn new(peer_id: &str, engine: &'a dyn NegotiationEngine, sender: Arc<SignalingSender>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            engine,
            sender,
            ice_servers: Vec::new(),
            observer: None,
        }
    }

    pub fn ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn observer(mut self, observer: Weak<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Decode the offer, create the peer connection and negotiate.
    pub fn build(self, offer_payload: &str) -> Result<Arc<Session>> {
        let offer = SessionDescription::from_json(offer_payload)?;
        if offer.sdp_type != SdpType::Offer {
            return Err(MasterError::ProtocolDecode(format!(
                "Expected offer from '{}', got {:?}",
                self.peer_id, offer.sdp_type
            )));
        }

        let peer_connection = self.engine.create_peer_connection(&self.ice_servers)?;

        let (video_transceiver, audio_transceiver) = {
            let guard = PeerGuard::new(peer_connection.as_ref());
            let video = peer_connection.add_transceiver(TrackKind::Video, TransceiverDirection::SendOnly)?;
            let audio = peer_connection.add_transceiver(TrackKind::Audio, TransceiverDirection::SendRecv)?;
            guard.disarm();
            (video, audio)
        };

        let session = Arc::new(Session {
            peer_id: self.peer_id.clone(),
            peer_connection,
            video_transceiver,
            audio_transceiver,
            terminated: AtomicBool::new(false),
            frame_index: AtomicU64::new(0),
            negotiation: Mutex::new(Negotiation::new()),
            created_at: Instant::now(),
        });

        let weak_session = Arc::downgrade(&session);
        let sender = self.sender.clone();
        session.peer_connection.on_local_candidate(Box::new(move |candidate| {
            if let Some(session) = weak_session.upgrade() {
                session.handle_local_candidate(candidate, &sender);
            }
        }));

        let weak_session = Arc::downgrade(&session);
        let observer = self.observer.clone();
        session.peer_connection.on_connection_state_change(Box::new(move |state| {
            let Some(session) = weak_session.upgrade() else {
                return;
            };
            if let Some(change) = session.handle_connection_state(state) {
                if let Some(observer) = observer.as_ref().and_then(Weak::upgrade) {
                    observer.on_session_state(session.peer_id(), change);
                }
            }
        }));

        let guard = PeerGuard::new(session.peer_connection.as_ref());
        if let Err(e) = session.negotiate(&offer, &self.sender) {
            session.mark_terminated();
            return Err(e);
        }
        guard.disarm();

        log::info!("[Session] Created session for '{}'", self.peer_id);
        Ok(session)
    }
}
