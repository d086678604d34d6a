//! Signaling message model.

use serde::{Deserialize, Serialize};

use crate::ice::TurnConfig;

/// Message delivered by the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// SDP offer from a viewer; payload is a JSON session description
    Offer {
        peer_id: String,
        payload: String,
        correlation_id: String,
    },
    /// Trickled ICE candidate from a viewer; payload is a JSON candidate
    IceCandidate { peer_id: String, payload: String },
    /// Anything the master does not act on (answers, status responses, ...)
    Other { kind: String, peer_id: String },
}

impl InboundMessage {
    pub fn peer_id(&self) -> &str {
        match self {
            InboundMessage::Offer { peer_id, .. }
            | InboundMessage::IceCandidate { peer_id, .. }
            | InboundMessage::Other { peer_id, .. } => peer_id,
        }
    }
}

/// Kind of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Answer,
    IceCandidate,
}

impl MessageKind {
    /// Wire action name
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Answer => "SDP_ANSWER",
            MessageKind::IceCandidate => "ICE_CANDIDATE",
        }
    }
}

/// Message addressed to one viewer.
///
/// `correlation_id` is a fresh token for answers and empty for candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub peer_id: String,
    pub kind: MessageKind,
    pub correlation_id: String,
    pub payload: String,
}

/// Signaling client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingClientState {
    New,
    GetConfig,
    Connecting,
    Connected,
    Disconnected,
}

/// Channel descriptor fetched before connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(default)]
    pub channel_name: String,
    /// TURN configurations, each with its own credential pair
    #[serde(default)]
    pub ice_servers: Vec<TurnConfig>,
}
