use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const DEFAULT_RELAY_URL: &str = "wss://example.com/api/connect";
pub const DEFAULT_CHANNEL_LABEL: &str = "beach-pair";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Drops the default STUN server so tests and LAN-only setups gather host
/// candidates only.
pub const DISABLE_STUN_ENV: &str = "BEACH_PAIR_DISABLE_STUN";

pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

pub fn default_ice_servers() -> Vec<String> {
    if env_truthy(DISABLE_STUN_ENV).unwrap_or(false) {
        Vec::new()
    } else {
        vec![DEFAULT_STUN_SERVER.to_string()]
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid relay url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("relay url must use ws, wss, http or https (got {0})")]
    UnsupportedScheme(String),
}

/// Settings for one pairing client.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub relay_url: String,
    /// Sent as `clientId` in every pair request.
    pub client_id: String,
    pub channel_label: String,
    pub reconnect_delay: Duration,
    pub ice_servers: Vec<String>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            client_id: std::env::consts::OS.to_string(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ice_servers: default_ice_servers(),
        }
    }
}

impl PairingConfig {
    /// Parses the relay URL, rewriting `http(s)` to `ws(s)`.
    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.relay_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.relay_url.clone(),
            source,
        })?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
        }
        Ok(url)
    }
}
