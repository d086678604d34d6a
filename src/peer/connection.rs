//! webrtc-rs backed negotiation engine.
//!
//! Wraps RTCPeerConnection behind the synchronous [`PeerConnection`] trait.
//! Calls block on the shared tokio runtime; engine callbacks are queued on an
//! unbounded channel and delivered in order by a per-connection event thread,
//! so handlers never run on a runtime worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionStateHandler, EncodedFrame, IceCandidateInit, LocalCandidateHandler, NegotiationEngine,
    PeerConnection, PeerConnectionState, SdpType, SessionDescription, TrackKind, Transceiver,
    TransceiverDirection,
};
use crate::error::{MasterError, Result};
use crate::ice::IceServerConfig;

/// Stream id shared by the video and audio tracks of every session
pub const DEFAULT_STREAM_ID: &str = "webrtc-master-stream";

const H264_PAYLOAD_TYPE: u8 = 102;
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const OPUS_PAYLOAD_TYPE: u8 = 111;
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

fn codec_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: H264_FMTP.to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: OPUS_FMTP.to_owned(),
            rtcp_feedback: vec![],
        },
    }
}

fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(TrackKind::Video),
                payload_type: H264_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| MasterError::NegotiationEngine(format!("Failed to register H.264 codec: {}", e)))?;
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(TrackKind::Audio),
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| MasterError::NegotiationEngine(format!("Failed to register Opus codec: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| MasterError::NegotiationEngine(format!("Failed to register interceptors: {}", e)))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Negotiation engine backed by webrtc-rs.
pub struct WebRtcEngine {
    api: Arc<API>,
    runtime: Handle,
    stream_id: String,
}

impl WebRtcEngine {
    /// Create an engine with H.264 (42e01f) video and Opus audio registered.
    pub fn new(runtime: Handle) -> Result<Self> {
        Ok(Self {
            api: Arc::new(build_api()?),
            runtime,
            stream_id: DEFAULT_STREAM_ID.to_string(),
        })
    }

    pub fn with_stream_id(mut self, stream_id: &str) -> Self {
        self.stream_id = stream_id.to_string();
        self
    }
}

impl NegotiationEngine for WebRtcEngine {
    fn create_peer_connection(&self, ice_servers: &[IceServerConfig]) -> Result<Box<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(IceServerConfig::to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let api = self.api.clone();
        let peer_connection = self
            .runtime
            .block_on(async move { api.new_peer_connection(config).await })
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to create peer connection: {}", e)))?;

        let peer = WebRtcPeerConnection::new(Arc::new(peer_connection), self.runtime.clone(), &self.stream_id)?;
        Ok(Box::new(peer))
    }
}

enum PeerEvent {
    LocalCandidate(Option<IceCandidateInit>),
    StateChange(PeerConnectionState),
    Shutdown,
}

#[derive(Default)]
struct PeerHandlers {
    on_candidate: Mutex<Option<Arc<dyn Fn(Option<IceCandidateInit>) + Send + Sync>>>,
    on_state: Mutex<Option<Arc<dyn Fn(PeerConnectionState) + Send + Sync>>>,
}

fn run_event_loop(mut rx: mpsc::UnboundedReceiver<PeerEvent>, handlers: Arc<PeerHandlers>) {
    while let Some(event) = rx.blocking_recv() {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let handler = handlers.on_candidate.lock().clone();
                match handler {
                    Some(h) => h(candidate),
                    None => log::debug!("[WebRtcPeer] Local candidate dropped, no handler"),
                }
            }
            PeerEvent::StateChange(state) => {
                let handler = handlers.on_state.lock().clone();
                if let Some(h) = handler {
                    h(state);
                }
            }
            PeerEvent::Shutdown => break,
        }
    }
    log::trace!("[WebRtcPeer] Event thread exiting");
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn to_candidate_init(candidate: &RTCIceCandidate) -> Option<IceCandidateInit> {
    match candidate.to_json() {
        Ok(json) => Some(IceCandidateInit {
            candidate: json.candidate,
            sdp_mid: json.sdp_mid,
            sdp_mline_index: json.sdp_mline_index,
            username_fragment: json.username_fragment,
        }),
        Err(e) => {
            log::warn!("[WebRtcPeer] Failed to serialize local candidate: {}", e);
            None
        }
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp.clone()),
        SdpType::Rollback => {
            return Err(MasterError::ProtocolDecode("Rollback descriptions are not supported".to_string()))
        }
    };
    result.map_err(|e| MasterError::ProtocolDecode(format!("Invalid SDP: {}", e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Answer,
    };
    SessionDescription { sdp_type, sdp: desc.sdp }
}

/// True if the SDP advertises trickle ICE support (`a=ice-options:trickle`).
pub fn sdp_supports_trickle(sdp: &str) -> bool {
    sdp.lines()
        .filter_map(|line| line.trim().strip_prefix("a=ice-options:"))
        .any(|options| options.split_whitespace().any(|o| o.eq_ignore_ascii_case("trickle")))
}

/// Single peer connection backed by RTCPeerConnection.
pub struct WebRtcPeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
    runtime: Handle,
    stream_id: String,
    handlers: Arc<PeerHandlers>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl WebRtcPeerConnection {
    fn new(peer_connection: Arc<RTCPeerConnection>, runtime: Handle, stream_id: &str) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<PeerEvent>();
        let handlers = Arc::new(PeerHandlers::default());

        let handlers_for_thread = handlers.clone();
        thread::Builder::new()
            .name("webrtc-peer-events".to_string())
            .spawn(move || run_event_loop(event_rx, handlers_for_thread))
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to spawn event thread: {}", e)))?;

        let tx_for_ice = event_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let event = match candidate {
                Some(c) => match to_candidate_init(&c) {
                    Some(init) => PeerEvent::LocalCandidate(Some(init)),
                    None => return Box::pin(async {}),
                },
                None => PeerEvent::LocalCandidate(None),
            };
            let _ = tx_for_ice.send(event);
            Box::pin(async {})
        }));

        let tx_for_state = event_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            log::debug!("[WebRtcPeer] Connection state: {:?}", s);
            let _ = tx_for_state.send(PeerEvent::StateChange(map_state(s)));
            Box::pin(async {})
        }));

        Ok(Self {
            peer_connection,
            runtime,
            stream_id: stream_id.to_string(),
            handlers,
            event_tx,
        })
    }
}

impl PeerConnection for WebRtcPeerConnection {
    fn add_transceiver(&self, kind: TrackKind, direction: TransceiverDirection) -> Result<Arc<dyn Transceiver>> {
        let track_id = match kind {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(kind),
            track_id.to_owned(),
            self.stream_id.clone(),
        ));

        let rtc_direction = match direction {
            TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
            TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
            TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
        };

        let pc = self.peer_connection.clone();
        let track_for_pc = track.clone();
        let rtp_sender = self
            .runtime
            .block_on(async move {
                let transceiver = pc
                    .add_transceiver_from_track(
                        track_for_pc as Arc<dyn TrackLocal + Send + Sync>,
                        Some(RTCRtpTransceiverInit {
                            direction: rtc_direction,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
                Ok::<_, webrtc::Error>(transceiver.sender().await)
            })
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to add {} transceiver: {}", track_id, e)))?;

        // Drain RTCP so the interceptors see receiver reports and NACKs
        self.runtime.spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        Ok(Arc::new(WebRtcTransceiver {
            kind,
            direction,
            track,
            runtime: self.runtime.clone(),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }))
    }

    fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        let rtc_desc = to_rtc_description(desc)?;
        let pc = self.peer_connection.clone();
        self.runtime
            .block_on(async move { pc.set_remote_description(rtc_desc).await })
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to set remote description: {}", e)))
    }

    fn create_answer(&self) -> Result<SessionDescription> {
        let pc = self.peer_connection.clone();
        let answer = self
            .runtime
            .block_on(async move { pc.create_answer(None).await })
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to create answer: {}", e)))?;
        Ok(from_rtc_description(answer))
    }

    fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        let rtc_desc = to_rtc_description(desc)?;
        let pc = self.peer_connection.clone();
        self.runtime
            .block_on(async move { pc.set_local_description(rtc_desc).await })
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to set local description: {}", e)))
    }

    fn local_description(&self) -> Option<SessionDescription> {
        let pc = self.peer_connection.clone();
        self.runtime
            .block_on(async move { pc.local_description().await })
            .map(from_rtc_description)
    }

    fn can_trickle_ice(&self) -> Option<bool> {
        let pc = self.peer_connection.clone();
        self.runtime
            .block_on(async move { pc.remote_description().await })
            .map(|desc| sdp_supports_trickle(&desc.sdp))
    }

    fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        let pc = self.peer_connection.clone();
        self.runtime
            .block_on(async move { pc.add_ice_candidate(init).await })
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to add ICE candidate: {}", e)))
    }

    fn on_local_candidate(&self, handler: LocalCandidateHandler) {
        *self.handlers.on_candidate.lock() = Some(Arc::from(handler));
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        *self.handlers.on_state.lock() = Some(Arc::from(handler));
    }

    fn close(&self) -> Result<()> {
        let pc = self.peer_connection.clone();
        self.runtime
            .block_on(async move { pc.close().await })
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to close peer connection: {}", e)))
    }
}

impl Drop for WebRtcPeerConnection {
    fn drop(&mut self) {
        // Events queued before this point are still delivered
        let _ = self.event_tx.send(PeerEvent::Shutdown);
    }
}

/// Outgoing track of one session
pub struct WebRtcTransceiver {
    kind: TrackKind,
    direction: TransceiverDirection,
    track: Arc<TrackLocalStaticSample>,
    runtime: Handle,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl WebRtcTransceiver {
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

impl Transceiver for WebRtcTransceiver {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn direction(&self) -> TransceiverDirection {
        self.direction
    }

    fn write_frame(&self, frame: &EncodedFrame) -> Result<()> {
        let sample = Sample {
            data: frame.data.clone(),
            duration: frame.duration,
            timestamp: UNIX_EPOCH + Duration::from_nanos(frame.presentation_ts.saturating_mul(100)),
            ..Default::default()
        };

        let track = self.track.clone();
        self.runtime
            .block_on(async move { track.write_sample(&sample).await })
            .map_err(|e| MasterError::NegotiationEngine(format!("Failed to write frame {}: {}", frame.index, e)))?;

        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
