//! Signaling transport trait and the shared outbound send path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::callback::SignalingCallbacks;
use super::message::{ChannelConfig, MessageKind, OutboundMessage};
use crate::error::{MasterError, Result};
use crate::peer::{IceCandidateInit, SessionDescription};
use crate::stream::now_100ns;

/// Signaling client timings and message counters.
///
/// Call times cover a single network exchange; client times cover the whole
/// trait call around it. `create_client_time` and `rebuild_time` are filled
/// in by the session manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalingMetrics {
    pub create_client_time: Duration,
    pub fetch_call_time: Duration,
    pub fetch_client_time: Duration,
    pub connect_call_time: Duration,
    pub connect_client_time: Duration,
    pub rebuild_time: Duration,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub decode_errors: u64,
}

/// Signaling service connection.
///
/// `connect` must return without waiting for inbound messages; callbacks are
/// invoked later from a transport-owned thread.
pub trait SignalingTransport: Send {
    fn fetch_channel_config(&mut self) -> Result<ChannelConfig>;
    fn connect(&mut self, callbacks: SignalingCallbacks) -> Result<()>;
    /// Deliver one message to a viewer, in order with earlier sends.
    fn send_message(&self, message: &OutboundMessage) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;

    fn metrics(&self) -> SignalingMetrics {
        SignalingMetrics::default()
    }
}

/// Creates a fresh transport client, used on startup and on rebuild
pub type TransportFactory = Box<dyn Fn() -> Result<Box<dyn SignalingTransport>> + Send + Sync>;

/// Outbound send path shared by every session.
///
/// Holds the current transport behind the send lock. Answers and candidates
/// from all sessions go through here, so sends are totally ordered.
pub struct SignalingSender {
    transport: Mutex<Option<Box<dyn SignalingTransport>>>,
    last_correlation: AtomicU64,
}

impl Default for SignalingSender {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingSender {
    pub fn new() -> Self {
        Self {
            transport: Mutex::new(None),
            last_correlation: AtomicU64::new(0),
        }
    }

    /// Fresh correlation token: current time in 100 ns units, strictly
    /// increasing across calls.
    pub fn next_correlation_id(&self) -> String {
        let now = now_100ns();
        let mut last = self.last_correlation.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last_correlation
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next.to_string(),
                Err(current) => last = current,
            }
        }
    }

    /// Send the local answer to a viewer.
    pub fn send_answer(&self, peer_id: &str, answer: &SessionDescription) -> Result<()> {
        let message = OutboundMessage {
            peer_id: peer_id.to_string(),
            kind: MessageKind::Answer,
            correlation_id: self.next_correlation_id(),
            payload: answer.to_json()?,
        };
        self.send(&message)
    }

    /// Send one local candidate to a viewer.
    pub fn send_ice_candidate(&self, peer_id: &str, candidate: &IceCandidateInit) -> Result<()> {
        let message = OutboundMessage {
            peer_id: peer_id.to_string(),
            kind: MessageKind::IceCandidate,
            correlation_id: String::new(),
            payload: candidate.to_json()?,
        };
        self.send(&message)
    }

    fn send(&self, message: &OutboundMessage) -> Result<()> {
        let guard = self.transport.lock();
        match guard.as_ref() {
            Some(transport) => transport.send_message(message),
            None => Err(MasterError::TransportSend(format!(
                "No signaling transport for {} to '{}'",
                message.kind.as_str(),
                message.peer_id
            ))),
        }
    }

    /// Swap the installed transport, returning the previous one.
    pub fn replace(&self, transport: Option<Box<dyn SignalingTransport>>) -> Option<Box<dyn SignalingTransport>> {
        std::mem::replace(&mut *self.transport.lock(), transport)
    }

    /// Metrics of the installed transport, if any.
    pub fn metrics(&self) -> Option<SignalingMetrics> {
        self.transport.lock().as_ref().map(|t| t.metrics())
    }

    pub fn is_installed(&self) -> bool {
        self.transport.lock().is_some()
    }
}
