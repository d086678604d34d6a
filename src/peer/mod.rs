//! Negotiation engine abstraction.
//!
//! The session core drives peer connections only through the traits in this
//! module. [`connection`] provides the webrtc-rs backed implementation.

pub mod connection;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};
use crate::ice::IceServerConfig;

pub use connection::WebRtcEngine;

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as carried over signaling: `{"type":"offer","sdp":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Decode a signaling payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        let desc: Self = serde_json::from_str(payload)
            .map_err(|e| MasterError::ProtocolDecode(format!("Invalid session description: {}", e)))?;
        if desc.sdp.trim().is_empty() {
            return Err(MasterError::ProtocolDecode("Session description has no SDP".to_string()));
        }
        Ok(desc)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| MasterError::ProtocolDecode(format!("Failed to encode session description: {}", e)))
    }
}

/// ICE candidate as carried over signaling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    /// Decode a signaling payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        let candidate: Self = serde_json::from_str(payload)
            .map_err(|e| MasterError::ProtocolDecode(format!("Invalid ICE candidate: {}", e)))?;
        if candidate.candidate.trim().is_empty() {
            return Err(MasterError::ProtocolDecode("ICE candidate is empty".to_string()));
        }
        Ok(candidate)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| MasterError::ProtocolDecode(format!("Failed to encode ICE candidate: {}", e)))
    }
}

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the session never carries media again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed | PeerConnectionState::Closed
        )
    }
}

/// Media kind of a track / transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendOnly,
    SendRecv,
    RecvOnly,
    Inactive,
}

/// One encoded frame as handed to a transceiver.
///
/// Timestamps are in 100 ns units.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
    pub key_frame: bool,
    pub presentation_ts: u64,
    pub decoding_ts: u64,
    /// Per-session sequence number
    pub index: u64,
}

/// Called for every locally gathered candidate; `None` marks end of gathering
pub type LocalCandidateHandler = Box<dyn Fn(Option<IceCandidateInit>) + Send + Sync>;

/// Called on every connection state transition
pub type ConnectionStateHandler = Box<dyn Fn(PeerConnectionState) + Send + Sync>;

/// Factory for peer connections
pub trait NegotiationEngine: Send + Sync {
    fn create_peer_connection(&self, ice_servers: &[IceServerConfig]) -> Result<Box<dyn PeerConnection>>;
}

/// Handle to a single peer connection.
///
/// All methods are synchronous; implementations backed by an async engine
/// block on their runtime. Handlers are invoked from an engine-owned thread,
/// never from inside a call to one of these methods.
pub trait PeerConnection: Send + Sync {
    fn add_transceiver(&self, kind: TrackKind, direction: TransceiverDirection) -> Result<Arc<dyn Transceiver>>;
    fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;
    fn create_answer(&self) -> Result<SessionDescription>;
    fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;
    /// Current local description, including every candidate gathered so far
    fn local_description(&self) -> Option<SessionDescription>;
    /// Whether the remote peer accepts trickled candidates; `None` until a
    /// remote description has been applied
    fn can_trickle_ice(&self) -> Option<bool>;
    fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<()>;
    fn on_local_candidate(&self, handler: LocalCandidateHandler);
    fn on_connection_state_change(&self, handler: ConnectionStateHandler);
    fn close(&self) -> Result<()>;
}

/// Outgoing media lane of a peer connection
pub trait Transceiver: Send + Sync {
    fn kind(&self) -> TrackKind;
    fn direction(&self) -> TransceiverDirection;
    fn write_frame(&self, frame: &EncodedFrame) -> Result<()>;
}
