//! Callbacks a signaling transport invokes on its delivery thread.

use super::message::{InboundMessage, SignalingClientState};

/// Transport lost its connection and will not reconnect by itself
pub const ERROR_CONNECTION_LOST: u32 = 0x5000_0001;
/// Service asked the client to reconnect
pub const ERROR_GO_AWAY: u32 = 0x5000_0002;
/// Inbound frame could not be decoded
pub const ERROR_MALFORMED_MESSAGE: u32 = 0x5000_0003;

/// Whether an `on_error` code requires rebuilding the transport.
pub fn is_unrecoverable(code: u32) -> bool {
    matches!(code, ERROR_CONNECTION_LOST | ERROR_GO_AWAY)
}

pub type MessageCallback = Box<dyn Fn(InboundMessage) + Send + Sync>;
pub type StateCallback = Box<dyn Fn(SignalingClientState) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(u32, &str) + Send + Sync>;

/// Signaling callbacks
pub struct SignalingCallbacks {
    /// Called for every decoded inbound message
    pub on_message: MessageCallback,
    /// Called when the client connection state changes
    pub on_state_change: StateCallback,
    /// Called with an error code and description
    pub on_error: ErrorCallback,
}

impl Default for SignalingCallbacks {
    fn default() -> Self {
        Self {
            on_message: Box::new(|_| {}),
            on_state_change: Box::new(|_| {}),
            on_error: Box::new(|_, _| {}),
        }
    }
}
