//! webrtc-master - one-to-many WebRTC master endpoint
//!
//! A single media source is offered to any number of viewers. Each viewer
//! reaches the master through a WebSocket signaling channel and gets its own
//! peer connection with a send-only H.264 video track and a send-receive Opus
//! audio track.
//!
//! Features:
//! - Session registry keyed by viewer id, with duplicate offer rejection
//! - SDP negotiation with and without trickle ICE
//! - Reaper loop that drops terminated sessions and rebuilds a lost transport
//! - Frame fan-out with an independent frame index per session
//! - Sample gate for flagged and out-of-order samples

pub mod config;
pub mod error;
pub mod ice;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod stream;

#[cfg(test)]
mod testing;

pub use config::MasterConfig;
pub use error::{MasterError, Result};
pub use ice::{IceServerConfig, TurnConfig};
pub use peer::{EncodedFrame, NegotiationEngine, PeerConnection, PeerConnectionState, TrackKind, WebRtcEngine};
pub use session::{NegotiationState, Session, SessionManager, StateChange};
pub use signaling::{SignalingTransport, WsClientConfig, WsSignalingClient};
pub use stream::{FanoutReport, MediaIngest, MediaSample, SampleFlags, SampleGate};

// Global tokio runtime for async operations
use std::sync::Arc;
use lazy_static::lazy_static;
use tokio::runtime::Runtime;

lazy_static! {
    /// Tokio runtime shared by the engine adapter and the signaling client.
    /// Both are driven from plain OS threads through its handle.
    pub static ref RUNTIME: Arc<Runtime> = Arc::new(
        Runtime::new().expect("Failed to create tokio runtime")
    );
}
