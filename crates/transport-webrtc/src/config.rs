use std::env;
use std::time::Duration;

use relay_session::IceServer;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DISABLE_STUN_ENV: &str = "RELAY_WEBRTC_DISABLE_STUN";

/// ICE agent timeouts handed to the `SettingEngine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceTimeouts {
    pub disconnected: Duration,
    pub failed: Duration,
    pub keepalive: Duration,
}

impl Default for IceTimeouts {
    fn default() -> Self {
        Self {
            disconnected: Duration::from_secs(3),
            failed: Duration::from_secs(10),
            keepalive: Duration::from_millis(500),
        }
    }
}

/// Configuration for the WebRTC media transport
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// ICE servers used until the relay supplies its own
    pub ice_servers: Vec<RTCIceServer>,
    pub ice_timeouts: IceTimeouts,
    /// Also gather loopback candidates, for peers on the same host
    pub include_loopback: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                ..Default::default()
            }],
            ice_timeouts: IceTimeouts::default(),
            include_loopback: false,
        }
    }
}

impl WebRtcConfig {
    /// Defaults, minus the public STUN server when `RELAY_WEBRTC_DISABLE_STUN`
    /// is set.
    pub fn from_env() -> Self {
        if env::var(DISABLE_STUN_ENV).is_ok() {
            Self::localhost()
        } else {
            Self::default()
        }
    }

    /// No STUN/TURN; loopback candidates included.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback: true,
            ..Default::default()
        }
    }

    pub fn builder() -> WebRtcConfigBuilder {
        WebRtcConfigBuilder::new()
    }
}

/// Builder for [`WebRtcConfig`]
pub struct WebRtcConfigBuilder {
    config: WebRtcConfig,
}

impl WebRtcConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: WebRtcConfig::from_env(),
        }
    }

    /// Drops every configured ICE server, including the default STUN one.
    pub fn without_ice_servers(mut self) -> Self {
        self.config.ice_servers.clear();
        self
    }

    pub fn ice_server(mut self, server: IceServer) -> Self {
        self.config.ice_servers.push(to_rtc_ice_server(&server));
        self
    }

    pub fn stun(self, url: impl Into<String>) -> Self {
        self.ice_server(IceServer {
            urls: vec![url.into()],
            username: None,
            credential: None,
        })
    }

    pub fn ice_timeouts(mut self, timeouts: IceTimeouts) -> Self {
        self.config.ice_timeouts = timeouts;
        self
    }

    pub fn include_loopback(mut self, include_loopback: bool) -> Self {
        self.config.include_loopback = include_loopback;
        self
    }

    pub fn build(self) -> WebRtcConfig {
        self.config
    }
}

impl Default for WebRtcConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_public_stun() {
        let config = WebRtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER]);
        assert!(!config.include_loopback);
    }

    #[test]
    fn localhost_config_has_no_ice_servers() {
        let config = WebRtcConfig::localhost();
        assert!(config.ice_servers.is_empty());
        assert!(config.include_loopback);
    }

    #[test]
    fn builder_replaces_servers() {
        let config = WebRtcConfig::builder()
            .without_ice_servers()
            .stun("stun:stun.relay.example:3478")
            .ice_server(IceServer {
                urls: vec!["turn:turn.relay.example:3478?transport=udp".into()],
                username: Some("user".into()),
                credential: Some("secret".into()),
            })
            .build();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.relay.example:3478"]);
        assert_eq!(config.ice_servers[1].username, "user");
        assert_eq!(config.ice_servers[1].credential, "secret");
    }
}
