//! Client configuration loaded from environment variables.
//!
//! Defaults point at a server on localhost so a client can start with zero
//! configuration during development.

use parley_shared::constants::DEFAULT_SERVER_PORT;
use parley_shared::types::UserId;

/// Media negotiation settings handed to the host's media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    /// STUN/TURN server urls.
    /// Env: `PARLEY_ICE_SERVERS` (comma separated)
    /// Default: `stun:stun.l.google.com:19302`
    pub ice_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base url of the event socket.
    /// Env: `PARLEY_SERVER_URL`
    /// Default: `ws://localhost:5431`
    pub server_url: String,

    /// Base url of the resource API.
    /// Env: `PARLEY_API_URL`
    /// Default: `http://localhost:5431/api`
    pub api_url: String,

    /// Identity of this session, also the local user id.
    /// Env: `PARLEY_SESSION_ID`
    /// Default: `anonymous`
    pub session_id: UserId,

    /// Sent as `X-Api-Key` on resource requests.
    /// Env: `PARLEY_API_KEY`
    /// Default: none.
    pub api_key: Option<String>,

    pub rtc: RtcConfig,

    /// Inbound frames buffered before the reader waits on the dispatcher.
    /// Env: `PARLEY_INBOUND_BUFFER`
    /// Default: `256`
    pub inbound_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://localhost:{DEFAULT_SERVER_PORT}"),
            api_url: format!("http://localhost:{DEFAULT_SERVER_PORT}/api"),
            session_id: UserId::from("anonymous"),
            api_key: None,
            rtc: RtcConfig::default(),
            inbound_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PARLEY_SERVER_URL") {
            config.server_url = url;
        }

        if let Ok(url) = std::env::var("PARLEY_API_URL") {
            config.api_url = url;
        }

        if let Ok(id) = std::env::var("PARLEY_SESSION_ID") {
            if !id.is_empty() {
                config.session_id = UserId::from(id);
            }
        }

        if let Ok(key) = std::env::var("PARLEY_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }

        if let Ok(servers) = std::env::var("PARLEY_ICE_SERVERS") {
            config.rtc.ice_servers = parse_list(&servers);
        }

        if let Ok(val) = std::env::var("PARLEY_INBOUND_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.inbound_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_INBOUND_BUFFER, using default"),
            }
        }

        config
    }

    /// Event socket url for this session: `<server_url>/ws/<session_id>`.
    pub fn ws_url(&self) -> String {
        path_join(&self.server_url, &["ws", self.session_id.as_str()])
    }
}

pub(crate) fn path_join(base: &str, segments: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for segment in segments {
        let segment = segment.trim_matches('/');
        if !segment.is_empty() {
            url.push('/');
            url.push_str(segment);
        }
    }
    url
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
