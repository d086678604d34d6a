//! WebSocket signaling client.
//!
//! Connects to `{signaling_url}/{channel}?clientId=...&role=master`, decodes
//! JSON envelopes into [`InboundMessage`]s and writes outbound envelopes
//! through a dedicated sender task. Inbound events are handed to a
//! `signaling-dispatch` thread which invokes the registered callbacks, so
//! callbacks may block without stalling the socket.
//!
//! The channel descriptor (TURN servers) comes from an HTTP GET on
//! `{control_url}/channels/{channel}`.
//!
//! Both the descriptor fetch and the WebSocket handshake are bounded by
//! `connect_timeout`; the caller may be holding the registry lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::callback::{SignalingCallbacks, ERROR_CONNECTION_LOST, ERROR_GO_AWAY, ERROR_MALFORMED_MESSAGE};
use super::message::{ChannelConfig, InboundMessage, OutboundMessage, SignalingClientState};
use super::transport::{SignalingMetrics, SignalingTransport};
use crate::config::MasterConfig;
use crate::error::{MasterError, Result};

/// Connection parameters for [`WsSignalingClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsClientConfig {
    pub signaling_url: String,
    pub control_url: String,
    pub channel_name: String,
    pub client_id: String,
    /// Bound for the descriptor fetch and for the WebSocket handshake
    pub connect_timeout: Duration,
}

impl WsClientConfig {
    pub fn from_master(config: &MasterConfig) -> Self {
        Self {
            signaling_url: config.signaling_url.clone(),
            control_url: config.control_base_url(),
            channel_name: config.channel_name.clone(),
            client_id: config.client_id.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    /// WebSocket URL for this channel
    pub fn connect_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.signaling_url)
            .map_err(|e| MasterError::Transport(format!("Invalid signaling URL '{}': {}", self.signaling_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| MasterError::Transport(format!("Signaling URL '{}' cannot carry a path", self.signaling_url)))?
            .pop_if_empty()
            .push(&self.channel_name);
        url.query_pairs_mut()
            .append_pair("clientId", &self.client_id)
            .append_pair("role", "master");
        Ok(url)
    }

    /// HTTP URL of the channel descriptor
    pub fn channel_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.control_url)
            .map_err(|e| MasterError::Transport(format!("Invalid control URL '{}': {}", self.control_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| MasterError::Transport(format!("Control URL '{}' cannot carry a path", self.control_url)))?
            .pop_if_empty()
            .push("channels")
            .push(&self.channel_name);
        Ok(url)
    }
}

/// Client statistics (atomic, lock-free)
///
/// Call times are in microseconds and describe the most recent fetch and
/// connect.
#[derive(Default)]
pub struct WsClientStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub decode_errors: AtomicU64,
    /// HTTP descriptor request alone
    pub fetch_call_us: AtomicU64,
    /// Whole `fetch_channel_config`
    pub fetch_client_us: AtomicU64,
    /// WebSocket handshake alone
    pub connect_call_us: AtomicU64,
    /// Whole `connect`
    pub connect_client_us: AtomicU64,
}

impl WsClientStats {
    fn record(counter: &AtomicU64, elapsed: Duration) {
        counter.store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn load(counter: &AtomicU64) -> Duration {
        Duration::from_micros(counter.load(Ordering::Relaxed))
    }

    /// Get statistics snapshot
    pub fn snapshot(&self) -> SignalingMetrics {
        SignalingMetrics {
            fetch_call_time: Self::load(&self.fetch_call_us),
            fetch_client_time: Self::load(&self.fetch_client_us),
            connect_call_time: Self::load(&self.connect_call_us),
            connect_client_time: Self::load(&self.connect_client_us),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundEnvelope {
    action: &'static str,
    recipient_client_id: String,
    message_payload: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    correlation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEnvelope {
    message_type: String,
    #[serde(default)]
    sender_client_id: String,
    #[serde(default)]
    message_payload: serde_json::Value,
    #[serde(default)]
    correlation_id: String,
    #[serde(default)]
    status_response: Option<StatusResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    #[serde(default)]
    status_code: u32,
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    description: String,
}

/// Event handed from the socket reader to the dispatch thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientEvent {
    Message(InboundMessage),
    State(SignalingClientState),
    Error(u32, String),
}

fn payload_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn encode_envelope(message: &OutboundMessage) -> Result<String> {
    let envelope = OutboundEnvelope {
        action: message.kind.as_str(),
        recipient_client_id: message.peer_id.clone(),
        message_payload: message.payload.clone(),
        correlation_id: message.correlation_id.clone(),
    };
    serde_json::to_string(&envelope)
        .map_err(|e| MasterError::TransportSend(format!("Failed to encode signaling message: {}", e)))
}

pub(crate) fn decode_envelope(text: &str) -> Result<ClientEvent> {
    let envelope: InboundEnvelope = serde_json::from_str(text)
        .map_err(|e| MasterError::ProtocolDecode(format!("Invalid signaling envelope: {}", e)))?;

    let peer_id = envelope.sender_client_id;
    let event = match envelope.message_type.as_str() {
        "SDP_OFFER" => ClientEvent::Message(InboundMessage::Offer {
            peer_id,
            payload: payload_to_string(envelope.message_payload),
            correlation_id: envelope.correlation_id,
        }),
        "ICE_CANDIDATE" => ClientEvent::Message(InboundMessage::IceCandidate {
            peer_id,
            payload: payload_to_string(envelope.message_payload),
        }),
        "GO_AWAY" => ClientEvent::Error(ERROR_GO_AWAY, "Signaling service requested reconnect".to_string()),
        "STATUS_RESPONSE" => match envelope.status_response {
            Some(status) if status.status_code >= 400 => ClientEvent::Error(
                status.status_code,
                format!("{}: {}", status.error_type, status.description),
            ),
            _ => ClientEvent::Message(InboundMessage::Other {
                kind: envelope.message_type,
                peer_id,
            }),
        },
        _ => ClientEvent::Message(InboundMessage::Other {
            kind: envelope.message_type,
            peer_id,
        }),
    };
    Ok(event)
}

/// Forward queued frames to the socket until the queue closes or a write fails.
async fn run_ws_writer<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Message>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            log::warn!("[WsSignaling] WebSocket write failed: {}", e);
            let _ = event_tx.send(ClientEvent::Error(
                ERROR_CONNECTION_LOST,
                format!("WebSocket write failed: {}", e),
            ));
            break;
        }
    }
}

fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    callbacks: SignalingCallbacks,
    active: Arc<AtomicBool>,
) {
    while let Some(event) = rx.blocking_recv() {
        // A disconnected client must not feed stale events to its owner
        if !active.load(Ordering::SeqCst) {
            continue;
        }
        match event {
            ClientEvent::Message(message) => (callbacks.on_message)(message),
            ClientEvent::State(state) => (callbacks.on_state_change)(state),
            ClientEvent::Error(code, message) => (callbacks.on_error)(code, &message),
        }
    }
    log::debug!("[WsSignaling] Dispatch thread exiting");
}

/// Signaling transport over a WebSocket
pub struct WsSignalingClient {
    config: WsClientConfig,
    runtime: Handle,
    ws_sender: Option<mpsc::UnboundedSender<Message>>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    active: Arc<AtomicBool>,
    pub stats: Arc<WsClientStats>,
}

impl WsSignalingClient {
    pub fn new(config: WsClientConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            ws_sender: None,
            reader_task: None,
            active: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(WsClientStats::default()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ws_sender.is_some() && self.active.load(Ordering::SeqCst)
    }

    async fn get_channel(url: &str) -> Result<ChannelConfig> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header("Accept", "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| MasterError::Transport(format!("Failed to build request: {}", e)))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| MasterError::Transport(format!("Channel request failed: {}", e)))?;

        let status = response.status();

        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| MasterError::Transport(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(MasterError::Transport(format!(
                "Channel endpoint returned {}: {}",
                status,
                String::from_utf8_lossy(&body_bytes)
            )));
        }

        serde_json::from_slice(&body_bytes)
            .map_err(|e| MasterError::ProtocolDecode(format!("Invalid channel descriptor: {}", e)))
    }
}

impl SignalingTransport for WsSignalingClient {
    fn fetch_channel_config(&mut self) -> Result<ChannelConfig> {
        let started = Instant::now();
        let url = self.config.channel_url()?.to_string();
        let timeout = self.config.connect_timeout;

        let request_url = url.clone();
        let result = self
            .runtime
            .block_on(async move { tokio::time::timeout(timeout, Self::get_channel(&request_url)).await });
        WsClientStats::record(&self.stats.fetch_call_us, started.elapsed());

        let mut channel = match result {
            Ok(channel) => channel?,
            Err(_) => {
                return Err(MasterError::Transport(format!(
                    "Channel request to {} timed out after {:?}",
                    url, timeout
                )))
            }
        };
        if channel.channel_name.is_empty() {
            channel.channel_name = self.config.channel_name.clone();
        }
        log::info!(
            "[WsSignaling] Channel '{}' has {} TURN configuration(s)",
            channel.channel_name,
            channel.ice_servers.len()
        );
        WsClientStats::record(&self.stats.fetch_client_us, started.elapsed());
        Ok(channel)
    }

    fn connect(&mut self, callbacks: SignalingCallbacks) -> Result<()> {
        if self.ws_sender.is_some() {
            return Err(MasterError::Transport("Signaling client already connected".to_string()));
        }
        let started = Instant::now();

        let url = self.config.connect_url()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let active = Arc::new(AtomicBool::new(true));
        self.active = active.clone();

        thread::Builder::new()
            .name("signaling-dispatch".to_string())
            .spawn(move || run_dispatcher(event_rx, callbacks, active))
            .map_err(|e| MasterError::Transport(format!("Failed to spawn dispatch thread: {}", e)))?;

        let _ = event_tx.send(ClientEvent::State(SignalingClientState::Connecting));

        let timeout = self.config.connect_timeout;
        let handshake_started = Instant::now();
        let connect_result = self.runtime.block_on(async {
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await
        });
        WsClientStats::record(&self.stats.connect_call_us, handshake_started.elapsed());

        let (ws_stream, _) = match connect_result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(MasterError::Transport(format!(
                    "Failed to connect to signaling server: {}",
                    e
                )));
            }
            Err(_) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(MasterError::Transport(format!(
                    "Signaling handshake with {} timed out after {:?}",
                    self.config.signaling_url, timeout
                )));
            }
        };

        log::info!(
            "[WsSignaling] Connected to {} (channel: '{}')",
            self.config.signaling_url,
            self.config.channel_name
        );

        let (ws_write, mut ws_read) = ws_stream.split();

        // Spawn WebSocket sender task
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        self.runtime.spawn(run_ws_writer(ws_write, rx, event_tx.clone()));
        self.ws_sender = Some(tx);

        let _ = event_tx.send(ClientEvent::State(SignalingClientState::Connected));

        let stats = self.stats.clone();
        let reader = self.runtime.spawn(async move {
            while let Some(result) = ws_read.next().await {
                match result {
                    Ok(Message::Text(text)) => match decode_envelope(&text) {
                        Ok(event) => {
                            stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            let _ = event_tx.send(event);
                        }
                        Err(e) => {
                            stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                            let _ = event_tx.send(ClientEvent::Error(ERROR_MALFORMED_MESSAGE, e.to_string()));
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        log::info!("[WsSignaling] Server closed connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(ClientEvent::Error(
                            ERROR_CONNECTION_LOST,
                            format!("WebSocket error: {}", e),
                        ));
                        let _ = event_tx.send(ClientEvent::State(SignalingClientState::Disconnected));
                        return;
                    }
                }
            }
            let _ = event_tx.send(ClientEvent::Error(
                ERROR_CONNECTION_LOST,
                "Signaling connection closed".to_string(),
            ));
            let _ = event_tx.send(ClientEvent::State(SignalingClientState::Disconnected));
        });
        self.reader_task = Some(reader);

        WsClientStats::record(&self.stats.connect_client_us, started.elapsed());
        Ok(())
    }

    fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        let sender = self
            .ws_sender
            .as_ref()
            .ok_or_else(|| MasterError::TransportSend("Signaling client not connected".to_string()))?;

        let json = encode_envelope(message)?;
        sender
            .send(Message::Text(json))
            .map_err(|_| MasterError::TransportSend(format!("Signaling socket closed, dropped message to '{}'", message.peer_id)))?;

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        log::debug!("[WsSignaling] Sent {} to '{}'", message.kind.as_str(), message.peer_id);
        Ok(())
    }

    fn metrics(&self) -> SignalingMetrics {
        self.stats.snapshot()
    }

    fn disconnect(&mut self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        if let Some(sender) = self.ws_sender.take() {
            let _ = sender.send(Message::Close(None));
        }
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
        Ok(())
    }
}

impl Drop for WsSignalingClient {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
