//! Error taxonomy for the master endpoint.

use thiserror::Error;

/// Errors raised by the session registry, negotiation and adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// Required configuration is absent (fatal at startup)
    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    /// Offer for a peer identity that already has a session
    #[error("Session already exists for peer '{0}'")]
    AlreadyExists(String),

    /// Candidate or command for a peer identity with no session
    #[error("No session for peer '{0}'")]
    NotFound(String),

    /// Malformed session description or ICE candidate payload
    #[error("Failed to decode signaling payload: {0}")]
    ProtocolDecode(String),

    /// Outbound signaling message could not be delivered
    #[error("Failed to send signaling message: {0}")]
    TransportSend(String),

    /// Peer connection / transceiver operation failed
    #[error("Negotiation engine failure: {0}")]
    NegotiationEngine(String),

    /// Transport reported an error it cannot recover from on its own
    #[error("Signaling transport unrecoverable: {0}")]
    TransportUnrecoverable(String),

    /// Transport connect/fetch failure
    #[error("Signaling transport error: {0}")]
    Transport(String),
}

impl MasterError {
    /// Errors that only affect one message and are dropped after logging.
    pub fn is_routing(&self) -> bool {
        matches!(self, MasterError::AlreadyExists(_) | MasterError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, MasterError>;
