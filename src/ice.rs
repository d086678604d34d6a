//! ICE (Interactive Connectivity Establishment) configuration.
//!
//! Provides helpers for configuring STUN and TURN servers and for assembling
//! the per-session server list from a channel descriptor.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default STUN server used when none is configured
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// ICE server configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a STUN-only server config
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server config with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// Convert to webrtc-rs RTCIceServer
    pub fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// TURN configuration as handed out by the signaling channel.
///
/// One configuration carries several URIs sharing a single credential pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnConfig {
    pub uris: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Credential lifetime in seconds (informational)
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// Build the server list for a new peer connection.
///
/// The STUN server always comes first, followed by one entry per URI of the
/// first `max_turn_configs` TURN configurations. Fewer TURN servers keep
/// candidate gathering short.
pub fn assemble_ice_servers(
    stun_url: &str,
    turn_configs: &[TurnConfig],
    max_turn_configs: usize,
) -> Vec<IceServerConfig> {
    let mut servers = vec![IceServerConfig::stun(stun_url)];

    for config in turn_configs.iter().take(max_turn_configs) {
        for uri in &config.uris {
            log::debug!("[Ice] TURN server {}: {}", servers.len(), uri);
            servers.push(IceServerConfig::turn(uri, &config.username, &config.password));
        }
    }

    servers
}
