//! Session registry and reaper loop.
//!
//! One registry lock guards the session map and the manager flags; every
//! signaling event, reap pass, transport rebuild and frame fan-out runs
//! under it. Outbound sends take the narrower send lock inside
//! [`SignalingSender`], always after the registry lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Session, SessionBuilder, SessionObserver, StateChange};
use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::ice::assemble_ice_servers;
use crate::peer::NegotiationEngine;
use crate::signaling::{
    is_unrecoverable, ChannelConfig, InboundMessage, SignalingCallbacks, SignalingMetrics, SignalingSender,
    TransportFactory,
};

/// Shortest reaper wait, for configurations that skipped validation
const MIN_REAP_WAIT: Duration = Duration::from_millis(10);

struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    connected: bool,
    recreate_requested: bool,
    ice_server_count: usize,
    channel: Option<ChannelConfig>,
    create_client_time: Duration,
    rebuild_time: Duration,
}

/// Owns every viewer session of the process
pub struct SessionManager {
    config: MasterConfig,
    engine: Box<dyn NegotiationEngine>,
    transport_factory: TransportFactory,
    sender: Arc<SignalingSender>,
    registry: Mutex<Registry>,
    cvar: Condvar,
    interrupted: AtomicBool,
    self_ref: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        config: MasterConfig,
        engine: Box<dyn NegotiationEngine>,
        transport_factory: TransportFactory,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            engine,
            transport_factory,
            sender: Arc::new(SignalingSender::new()),
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                connected: false,
                recreate_requested: false,
                ice_server_count: 0,
                channel: None,
                create_client_time: Duration::ZERO,
                rebuild_time: Duration::ZERO,
            }),
            cvar: Condvar::new(),
            interrupted: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Create the signaling transport, fetch the channel descriptor and connect.
    pub fn connect(&self) -> Result<()> {
        let mut reg = self.registry.lock();
        self.rebuild_transport(&mut reg)
    }

    /// Drop the current transport, if any.
    pub fn disconnect(&self) {
        let _reg = self.registry.lock();
        if let Some(mut transport) = self.sender.replace(None) {
            if let Err(e) = transport.disconnect() {
                log::warn!("[SessionManager] Transport disconnect failed: {}", e);
            }
        }
    }

    fn rebuild_transport(&self, reg: &mut Registry) -> Result<()> {
        if let Some(mut old) = self.sender.replace(None) {
            if let Err(e) = old.disconnect() {
                log::warn!("[SessionManager] Old transport disconnect failed: {}", e);
            }
        }

        let started = Instant::now();
        let mut transport = (self.transport_factory)()?;
        let create_client_time = started.elapsed();
        let channel = transport.fetch_channel_config()?;
        transport.connect(self.signaling_callbacks())?;

        let metrics = SignalingMetrics {
            create_client_time,
            rebuild_time: started.elapsed(),
            ..transport.metrics()
        };
        self.sender.replace(Some(transport));

        log::info!("[SessionManager] Signaling connected for channel '{}'", channel.channel_name);
        log::info!(
            "[SessionManager] Signaling metrics: create {:?}, fetch {:?} (request {:?}), connect {:?} (handshake {:?}), total {:?}",
            metrics.create_client_time,
            metrics.fetch_client_time,
            metrics.fetch_call_time,
            metrics.connect_client_time,
            metrics.connect_call_time,
            metrics.rebuild_time
        );
        reg.channel = Some(channel);
        reg.create_client_time = metrics.create_client_time;
        reg.rebuild_time = metrics.rebuild_time;
        Ok(())
    }

    fn signaling_callbacks(&self) -> SignalingCallbacks {
        let for_message = self.self_ref.clone();
        let for_state = self.self_ref.clone();
        let for_error = self.self_ref.clone();

        SignalingCallbacks {
            on_message: Box::new(move |message| {
                let Some(manager) = for_message.upgrade() else {
                    return;
                };
                let peer_id = message.peer_id().to_string();
                if let Err(e) = manager.dispatch(message) {
                    if e.is_routing() {
                        log::warn!("[SessionManager] Dropped message from '{}': {}", peer_id, e);
                    } else {
                        log::error!("[SessionManager] Message from '{}' failed: {}", peer_id, e);
                    }
                }
            }),
            on_state_change: Box::new(move |state| {
                log::debug!("[SessionManager] Signaling state: {:?}", state);
                if let Some(manager) = for_state.upgrade() {
                    manager.cvar.notify_all();
                }
            }),
            on_error: Box::new(move |code, message| {
                if !is_unrecoverable(code) {
                    log::warn!("[SessionManager] Signaling error 0x{:08x}: {}", code, message);
                    return;
                }
                let e = MasterError::TransportUnrecoverable(format!("0x{:08x}: {}", code, message));
                log::error!("[SessionManager] {}, rebuilding transport", e);
                if let Some(manager) = for_error.upgrade() {
                    manager.request_recreate();
                }
            }),
        }
    }

    /// Route one inbound signaling message.
    pub fn dispatch(&self, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::Offer {
                peer_id,
                payload,
                correlation_id,
            } => {
                log::debug!("[SessionManager] Offer from '{}' ({})", peer_id, correlation_id);
                self.handle_offer(&peer_id, &payload)
            }
            InboundMessage::IceCandidate { peer_id, payload } => self.handle_remote_candidate(&peer_id, &payload),
            InboundMessage::Other { kind, peer_id } => {
                log::debug!("[SessionManager] Ignoring {} from '{}'", kind, peer_id);
                Ok(())
            }
        }
    }

    /// Create and negotiate a session for a new viewer.
    pub fn handle_offer(&self, peer_id: &str, payload: &str) -> Result<()> {
        let mut reg = self.registry.lock();

        if reg.sessions.contains_key(peer_id) {
            return Err(MasterError::AlreadyExists(peer_id.to_string()));
        }

        let turn_configs = reg.channel.as_ref().map(|c| c.ice_servers.as_slice()).unwrap_or(&[]);
        let ice_servers = assemble_ice_servers(&self.config.stun_url, turn_configs, self.config.max_turn_configs);
        reg.ice_server_count = ice_servers.len();

        let observer: Weak<dyn SessionObserver> = self.self_ref.clone();
        let session = SessionBuilder::new(peer_id, self.engine.as_ref(), self.sender.clone())
            .ice_servers(ice_servers)
            .observer(observer)
            .build(payload)?;

        reg.sessions.insert(peer_id.to_string(), session);
        log::info!("[SessionManager] {} active session(s)", reg.sessions.len());
        Ok(())
    }

    /// Apply a viewer's trickled candidate to its session.
    pub fn handle_remote_candidate(&self, peer_id: &str, payload: &str) -> Result<()> {
        let reg = self.registry.lock();
        let session = reg
            .sessions
            .get(peer_id)
            .ok_or_else(|| MasterError::NotFound(peer_id.to_string()))?;
        session.add_remote_candidate(payload)
    }

    /// Close and remove every terminated session. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let mut reg = self.registry.lock();
        Self::reap_locked(&mut reg)
    }

    fn reap_locked(reg: &mut Registry) -> usize {
        let dead: Vec<String> = reg
            .sessions
            .iter()
            .filter(|(_, session)| session.is_terminated())
            .map(|(peer_id, _)| peer_id.clone())
            .collect();

        for peer_id in &dead {
            if let Some(session) = reg.sessions.remove(peer_id) {
                session.close();
                log::info!("[SessionManager] Reaped session '{}'", peer_id);
            }
        }
        dead.len()
    }

    /// Terminate a session from the manager side; the reaper removes it.
    pub fn terminate(&self, peer_id: &str) -> Result<()> {
        let reg = self.registry.lock();
        let session = reg
            .sessions
            .get(peer_id)
            .ok_or_else(|| MasterError::NotFound(peer_id.to_string()))?;
        if session.mark_terminated() {
            self.cvar.notify_all();
        }
        Ok(())
    }

    /// Ask the reaper to rebuild the signaling transport.
    pub fn request_recreate(&self) {
        let mut reg = self.registry.lock();
        reg.recreate_requested = true;
        drop(reg);
        self.cvar.notify_all();
    }

    /// Reap periodically until [`interrupt`](Self::interrupt) is called.
    ///
    /// Does not release sessions on exit; call
    /// [`shutdown_sessions`](Self::shutdown_sessions) afterwards.
    pub fn run_reaper(&self) {
        log::debug!("[SessionManager] Reaper running every {:?}", self.config.reap_interval);
        let mut reg = self.registry.lock();

        while !self.interrupted.load(Ordering::SeqCst) {
            let reaped = Self::reap_locked(&mut reg);
            if reaped > 0 {
                log::debug!("[SessionManager] Reaped {} session(s)", reaped);
            }

            if reg.recreate_requested {
                log::info!("[SessionManager] Rebuilding signaling transport");
                match self.rebuild_transport(&mut reg) {
                    Ok(()) => reg.recreate_requested = false,
                    Err(e) => log::error!("[SessionManager] Transport rebuild failed, retrying next tick: {}", e),
                }
            }

            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
            self.cvar.wait_for(&mut reg, self.config.reap_interval.max(MIN_REAP_WAIT));
        }

        log::debug!("[SessionManager] Reaper stopped");
    }

    /// Run the reaper on a dedicated `session-reaper` thread.
    pub fn spawn_reaper(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let manager = self.clone();
        thread::Builder::new()
            .name("session-reaper".to_string())
            .spawn(move || manager.run_reaper())
            .map_err(|e| MasterError::Transport(format!("Failed to spawn reaper thread: {}", e)))
    }

    /// Stop the reaper loop.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        // Taking the lock orders this with the reaper's flag check
        let _reg = self.registry.lock();
        self.cvar.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Close every session and empty the registry.
    pub fn shutdown_sessions(&self) {
        let mut reg = self.registry.lock();
        for (peer_id, session) in reg.sessions.drain() {
            session.mark_terminated();
            session.close();
            log::debug!("[SessionManager] Closed session '{}'", peer_id);
        }
        reg.connected = false;
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.registry.lock().sessions.contains_key(peer_id)
    }

    pub fn session(&self, peer_id: &str) -> Option<Arc<Session>> {
        self.registry.lock().sessions.get(peer_id).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.registry.lock().connected
    }

    pub fn recreate_requested(&self) -> bool {
        self.registry.lock().recreate_requested
    }

    /// STUN/TURN endpoint count used for the most recent session
    pub fn ice_server_count(&self) -> usize {
        self.registry.lock().ice_server_count
    }

    pub fn channel_config(&self) -> Option<ChannelConfig> {
        self.registry.lock().channel.clone()
    }

    /// Metrics of the current signaling transport with the timings of the
    /// rebuild that installed it. `None` while no transport is installed.
    pub fn signaling_metrics(&self) -> Option<SignalingMetrics> {
        let reg = self.registry.lock();
        let metrics = self.sender.metrics()?;
        Some(SignalingMetrics {
            create_client_time: reg.create_client_time,
            rebuild_time: reg.rebuild_time,
            ..metrics
        })
    }

    /// Run `f` over the live registry while holding the registry lock.
    pub(crate) fn with_sessions<R>(&self, f: impl FnOnce(&HashMap<String, Arc<Session>>) -> R) -> R {
        let reg = self.registry.lock();
        f(&reg.sessions)
    }
}

impl SessionObserver for SessionManager {
    fn on_session_state(&self, peer_id: &str, change: StateChange) {
        let mut reg = self.registry.lock();
        match change {
            StateChange::Connected => reg.connected = true,
            StateChange::Terminated => {
                log::info!("[SessionManager] Session '{}' terminated", peer_id);
                reg.connected = false;
            }
            StateChange::Other(_) => reg.connected = false,
        }
        drop(reg);
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::TurnConfig;
    use crate::peer::{IceCandidateInit, PeerConnectionState};
    use crate::signaling::{MessageKind, SignalingTransport, ERROR_CONNECTION_LOST, ERROR_MALFORMED_MESSAGE};
    use crate::stream::MediaSample;
    use crate::testing::{offer_json, MockEngine, MockTransport};
    use std::time::{Duration, Instant};

    struct Harness {
        manager: Arc<SessionManager>,
        engine: MockEngine,
        transport: MockTransport,
    }

    fn harness(trickle: bool) -> Harness {
        let engine = MockEngine::new().with_trickle(trickle);
        let transport = MockTransport::new().with_channel(ChannelConfig {
            channel_name: "test-channel".to_string(),
            ice_servers: vec![
                TurnConfig {
                    uris: vec!["turn:a:443?transport=udp".to_string(), "turns:a:443?transport=tcp".to_string()],
                    username: "u".to_string(),
                    password: "p".to_string(),
                    ttl: None,
                },
                TurnConfig {
                    uris: vec!["turn:b:443".to_string()],
                    ..Default::default()
                },
            ],
        });

        let config = MasterConfig {
            channel_name: "test-channel".to_string(),
            signaling_url: "ws://localhost:1".to_string(),
            reap_interval: Duration::from_millis(50),
            ..Default::default()
        };

        let factory_transport = transport.clone();
        let manager = SessionManager::new(
            config,
            Box::new(engine.clone()),
            Box::new(move || -> Result<Box<dyn SignalingTransport>> { Ok(Box::new(factory_transport.clone())) }),
        );
        manager.connect().unwrap();

        Harness {
            manager,
            engine,
            transport,
        }
    }

    fn offer(peer_id: &str) -> InboundMessage {
        InboundMessage::Offer {
            peer_id: peer_id.to_string(),
            payload: offer_json(),
            correlation_id: "1".to_string(),
        }
    }

    #[test]
    fn test_connect_fetches_channel() {
        let h = harness(true);
        assert_eq!(h.transport.connect_count(), 1);
        assert_eq!(h.manager.channel_config().unwrap().channel_name, "test-channel");
    }

    #[test]
    fn test_distinct_offers_create_one_session_each() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        h.manager.dispatch(offer("b")).unwrap();
        h.manager.dispatch(offer("c")).unwrap();

        assert_eq!(h.manager.session_count(), 3);
        assert!(h.manager.contains("b"));
        assert_eq!(h.engine.connections_created(), 3);
    }

    #[test]
    fn test_ice_servers_use_first_turn_config_only() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();

        assert_eq!(h.manager.ice_server_count(), 3);
        let servers = h.engine.last_connection().unwrap().ice_servers();
        assert_eq!(servers[0].urls[0], h.manager.config().stun_url);
        assert!(servers.iter().all(|s| !s.urls[0].starts_with("turn:b")));
    }

    #[test]
    fn test_duplicate_offer_rejected() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        let before = h.manager.session("a").unwrap();

        let result = h.manager.dispatch(offer("a"));
        assert_eq!(result, Err(MasterError::AlreadyExists("a".to_string())));
        assert_eq!(h.manager.session_count(), 1);
        assert!(Arc::ptr_eq(&before, &h.manager.session("a").unwrap()));
        assert_eq!(h.engine.connections_created(), 1);
    }

    #[test]
    fn test_candidate_for_unknown_peer() {
        let h = harness(true);
        let result = h.manager.dispatch(InboundMessage::IceCandidate {
            peer_id: "ghost".to_string(),
            payload: r#"{"candidate":"candidate:1"}"#.to_string(),
        });
        assert_eq!(result, Err(MasterError::NotFound("ghost".to_string())));
        assert_eq!(h.manager.session_count(), 0);
        assert_eq!(h.engine.connections_created(), 0);
    }

    #[test]
    fn test_remote_candidate_routed_to_session() {
        let h = harness(false);
        h.manager.dispatch(offer("a")).unwrap();
        h.manager
            .dispatch(InboundMessage::IceCandidate {
                peer_id: "a".to_string(),
                payload: r#"{"candidate":"candidate:9 1 UDP 1 10.0.0.9 9 typ host","sdpMLineIndex":0}"#.to_string(),
            })
            .unwrap();
        assert_eq!(h.engine.last_connection().unwrap().remote_candidates().len(), 1);
    }

    #[test]
    fn test_other_messages_ignored() {
        let h = harness(true);
        h.manager
            .dispatch(InboundMessage::Other {
                kind: "SDP_ANSWER".to_string(),
                peer_id: "a".to_string(),
            })
            .unwrap();
        assert_eq!(h.manager.session_count(), 0);
    }

    #[test]
    fn test_failed_offer_leaves_registry_unchanged() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();

        h.engine.fail_next_remote_description();
        let result = h.manager.dispatch(offer("b"));
        assert!(matches!(result, Err(MasterError::NegotiationEngine(_))));
        assert_eq!(h.manager.session_count(), 1);
        assert!(!h.manager.contains("b"));
        assert!(h.engine.last_connection().unwrap().is_closed());

        let result = h.manager.dispatch(InboundMessage::Offer {
            peer_id: "c".to_string(),
            payload: "not json".to_string(),
            correlation_id: String::new(),
        });
        assert!(matches!(result, Err(MasterError::ProtocolDecode(_))));
        assert_eq!(h.manager.session_count(), 1);
    }

    #[test]
    fn test_answer_send_failure_rolls_back() {
        let h = harness(true);
        h.transport.set_fail_sends(true);
        let result = h.manager.dispatch(offer("a"));
        assert!(matches!(result, Err(MasterError::TransportSend(_))));
        assert!(!h.manager.contains("a"));
        assert!(h.engine.last_connection().unwrap().is_closed());
    }

    #[test]
    fn test_candidate_send_failure_keeps_session() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        h.transport.set_fail_sends(true);

        let pc = h.engine.last_connection().unwrap();
        pc.emit_candidate(Some(IceCandidateInit {
            candidate: "candidate:1 1 UDP 1 10.0.0.1 9 typ host".to_string(),
            ..Default::default()
        }));

        let session = h.manager.session("a").unwrap();
        assert!(!session.is_terminated());
    }

    #[test]
    fn test_reap_is_idempotent() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        h.manager.dispatch(offer("b")).unwrap();

        assert_eq!(h.manager.reap(), 0);
        h.manager.terminate("a").unwrap();
        assert_eq!(h.manager.reap(), 1);
        assert_eq!(h.manager.reap(), 0);
        assert_eq!(h.manager.session_count(), 1);
        assert!(h.manager.contains("b"));
    }

    #[test]
    fn test_terminate_unknown_peer() {
        let h = harness(true);
        assert_eq!(h.manager.terminate("nobody"), Err(MasterError::NotFound("nobody".to_string())));
    }

    #[test]
    fn test_connection_state_drives_connected_flag() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        let pc = h.engine.last_connection().unwrap();

        pc.emit_state(PeerConnectionState::Connected);
        assert!(h.manager.is_connected());

        pc.emit_state(PeerConnectionState::Connecting);
        assert!(!h.manager.is_connected());

        pc.emit_state(PeerConnectionState::Connected);
        assert!(h.manager.is_connected());

        pc.emit_state(PeerConnectionState::Failed);
        assert!(!h.manager.is_connected());
        assert!(h.manager.session("a").unwrap().is_terminated());
    }

    #[test]
    fn test_scenario_terminated_session_gets_no_frames() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        let pc_a = h.engine.last_connection().unwrap();
        h.manager.dispatch(offer("b")).unwrap();
        let pc_b = h.engine.last_connection().unwrap();

        pc_a.emit_state(PeerConnectionState::Failed);
        assert_eq!(h.manager.reap(), 1);
        assert!(pc_a.is_closed());

        let report = h.manager.route_frame(&MediaSample::video(vec![0u8; 16], true, 1_000_000));
        assert_eq!(report.delivered, 1);

        let frames = pc_b.video().frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].index, 1);
        assert!(pc_a.video().frames().is_empty());
    }

    #[test]
    fn test_scenario_no_trickle_single_answer() {
        let h = harness(false);
        h.manager.dispatch(offer("a")).unwrap();
        assert!(h.transport.sent().is_empty());

        let pc = h.engine.last_connection().unwrap();
        pc.emit_candidate(Some(IceCandidateInit {
            candidate: "candidate:1 1 UDP 1 10.0.0.1 9 typ host".to_string(),
            ..Default::default()
        }));
        pc.emit_candidate(None);

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Answer);
        assert_eq!(sent[0].peer_id, "a");
        assert!(!sent[0].correlation_id.is_empty());
    }

    #[test]
    fn test_unrecoverable_error_triggers_rebuild() {
        let h = harness(true);
        h.transport.report_error(ERROR_MALFORMED_MESSAGE, "bad frame");
        assert!(!h.manager.recreate_requested());

        h.transport.report_error(ERROR_CONNECTION_LOST, "socket closed");
        assert!(h.manager.recreate_requested());

        let reaper = h.manager.spawn_reaper().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while h.manager.recreate_requested() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!h.manager.recreate_requested());
        assert_eq!(h.transport.connect_count(), 2);
        assert!(h.transport.disconnect_count() >= 1);

        h.manager.interrupt();
        reaper.join().unwrap();
    }

    #[test]
    fn test_failed_rebuild_retries() {
        let h = harness(true);
        h.transport.set_fail_connect(true);
        h.manager.request_recreate();

        let reaper = h.manager.spawn_reaper().unwrap();
        thread::sleep(Duration::from_millis(120));
        assert!(h.manager.recreate_requested());

        h.transport.set_fail_connect(false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while h.manager.recreate_requested() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!h.manager.recreate_requested());

        h.manager.interrupt();
        reaper.join().unwrap();
    }

    #[test]
    fn test_reaper_removes_terminated_sessions() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        let reaper = h.manager.spawn_reaper().unwrap();

        h.engine.last_connection().unwrap().emit_state(PeerConnectionState::Closed);
        let deadline = Instant::now() + Duration::from_secs(2);
        while h.manager.contains("a") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!h.manager.contains("a"));

        h.manager.interrupt();
        reaper.join().unwrap();
    }

    #[test]
    fn test_interrupt_stops_reaper_promptly() {
        let h = harness(true);
        let manager = SessionManager::new(
            MasterConfig {
                reap_interval: Duration::from_secs(60),
                ..h.manager.config().clone()
            },
            Box::new(h.engine.clone()),
            Box::new(|| -> Result<Box<dyn SignalingTransport>> { Err(MasterError::Transport("unused".to_string())) }),
        );

        let reaper = manager.spawn_reaper().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        manager.interrupt();
        reaper.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(manager.is_interrupted());
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        h.manager.dispatch(offer("b")).unwrap();

        h.manager.shutdown_sessions();
        assert_eq!(h.manager.session_count(), 0);
        assert_eq!(h.engine.closed_count(), 2);

        h.manager.disconnect();
        assert_eq!(h.transport.disconnect_count(), 1);
    }

    #[test]
    fn test_concurrent_duplicate_offers_serialize() {
        let h = harness(true);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = h.manager.clone();
            handles.push(thread::spawn(move || manager.handle_offer("same", &offer_json())));
        }
        let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == MasterError::AlreadyExists("same".to_string())));
        assert_eq!(h.manager.session_count(), 1);
    }

    #[test]
    fn test_transport_delivery_reaches_dispatch() {
        let h = harness(true);
        h.transport.deliver(offer("viewer-9"));
        assert!(h.manager.contains("viewer-9"));

        // Duplicate is logged and dropped, not panicked on
        h.transport.deliver(offer("viewer-9"));
        assert_eq!(h.manager.session_count(), 1);

        let sent = h.transport.sent();
        assert_eq!(sent.iter().filter(|m| m.kind == MessageKind::Answer).count(), 1);
    }

    #[test]
    fn test_signaling_metrics_after_connect() {
        let h = harness(true);
        let metrics = h.manager.signaling_metrics().unwrap();
        assert!(metrics.rebuild_time >= metrics.create_client_time);
        assert_eq!(metrics.messages_sent, 0);

        h.manager.dispatch(offer("a")).unwrap();
        assert_eq!(h.manager.signaling_metrics().unwrap().messages_sent, 1);

        h.manager.disconnect();
        assert!(h.manager.signaling_metrics().is_none());
    }

    #[test]
    fn test_frame_tracks_are_independent_per_session() {
        let h = harness(true);
        h.manager.dispatch(offer("a")).unwrap();
        let pc = h.engine.last_connection().unwrap();

        h.manager.route_frame(&MediaSample::video(vec![1u8; 4], true, 0));
        h.manager.route_frame(&MediaSample::audio(vec![2u8; 4], 20_000_000));

        assert_eq!(pc.video().frames()[0].index, 1);
        assert_eq!(pc.audio().frames()[0].index, 2);
        assert_eq!(h.manager.session("a").unwrap().frame_index(), 2);
    }
}
