//! Master endpoint configuration.
//!
//! Values come from the environment (see [`MasterConfig::from_env`]) or a
//! JSON file; anything not set falls back to [`MasterConfig::default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};
use crate::ice::DEFAULT_STUN_URL;

pub const ENV_CHANNEL: &str = "WEBRTC_MASTER_CHANNEL";
pub const ENV_SIGNALING_URL: &str = "WEBRTC_MASTER_SIGNALING_URL";
pub const ENV_CONTROL_URL: &str = "WEBRTC_MASTER_CONTROL_URL";
pub const ENV_CLIENT_ID: &str = "WEBRTC_MASTER_CLIENT_ID";
pub const ENV_STUN_URL: &str = "WEBRTC_MASTER_STUN_URL";
pub const ENV_REAP_INTERVAL: &str = "WEBRTC_MASTER_REAP_INTERVAL_SECS";
pub const ENV_MAX_TURN_CONFIGS: &str = "WEBRTC_MASTER_MAX_TURN_CONFIGS";
pub const ENV_CONNECT_TIMEOUT: &str = "WEBRTC_MASTER_CONNECT_TIMEOUT_SECS";

/// Client identity announced to the signaling service
pub const DEFAULT_CLIENT_ID: &str = "webrtc-master";

/// Reaper wake-up interval
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for each signaling network call (descriptor fetch, WebSocket handshake)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Master endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Signaling channel name
    pub channel_name: String,
    /// WebSocket signaling base URL (e.g. "wss://signaling.example.com")
    pub signaling_url: String,
    /// HTTP base URL for channel descriptors (derived from signaling_url if None)
    pub control_url: Option<String>,
    /// Identity of this master on the channel
    pub client_id: String,
    /// STUN server placed first in every session's ICE server list
    pub stun_url: String,
    /// How often the reaper wakes when nothing signals it
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,
    /// Number of TURN configurations used per session
    pub max_turn_configs: usize,
    /// Timeout for each signaling network call; these run under the registry lock
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            channel_name: String::new(),
            signaling_url: String::new(),
            control_url: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            stun_url: DEFAULT_STUN_URL.to_string(),
            reap_interval: DEFAULT_REAP_INTERVAL,
            max_turn_configs: 1,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl MasterConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (environment, map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(channel) = get(ENV_CHANNEL) {
            config.channel_name = channel;
        }
        if let Some(url) = get(ENV_SIGNALING_URL) {
            config.signaling_url = url;
        }
        config.control_url = get(ENV_CONTROL_URL);
        if let Some(id) = get(ENV_CLIENT_ID) {
            config.client_id = id;
        }
        if let Some(url) = get(ENV_STUN_URL) {
            config.stun_url = url;
        }
        if let Some(secs) = get(ENV_REAP_INTERVAL) {
            let secs: u64 = secs.parse().map_err(|e| {
                MasterError::ConfigMissing(format!("{} is not a number of seconds: {}", ENV_REAP_INTERVAL, e))
            })?;
            config.reap_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(count) = get(ENV_MAX_TURN_CONFIGS) {
            config.max_turn_configs = count.parse().map_err(|e| {
                MasterError::ConfigMissing(format!("{} is not a count: {}", ENV_MAX_TURN_CONFIGS, e))
            })?;
        }

        if let Some(secs) = get(ENV_CONNECT_TIMEOUT) {
            let secs: u64 = secs.parse().map_err(|e| {
                MasterError::ConfigMissing(format!("{} is not a number of seconds: {}", ENV_CONNECT_TIMEOUT, e))
            })?;
            config.connect_timeout = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }

    /// Load from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MasterError::ConfigMissing(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            MasterError::ConfigMissing(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that everything needed to start is present.
    pub fn validate(&self) -> Result<()> {
        if self.channel_name.is_empty() {
            return Err(MasterError::ConfigMissing(format!(
                "channel name ({} or first argument)",
                ENV_CHANNEL
            )));
        }
        if self.signaling_url.is_empty() {
            return Err(MasterError::ConfigMissing(ENV_SIGNALING_URL.to_string()));
        }
        if self.reap_interval.is_zero() {
            return Err(MasterError::ConfigMissing(format!(
                "reap interval must be at least 1 second ({})",
                ENV_REAP_INTERVAL
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(MasterError::ConfigMissing(format!(
                "connect timeout must be at least 1 second ({})",
                ENV_CONNECT_TIMEOUT
            )));
        }
        Ok(())
    }

    /// HTTP base URL for the channel descriptor endpoint.
    pub fn control_base_url(&self) -> String {
        if let Some(ref url) = self.control_url {
            return url.trim_end_matches('/').to_string();
        }
        let base = self.signaling_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            base.to_string()
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
