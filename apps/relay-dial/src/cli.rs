use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use relay_session::{
    Configuration, DataChannelRequest, Direction, IceServer, NegotiationRole, SessionError,
    SessionIdentity, SessionParams,
};
use serde_json::Value;
use thiserror::Error;
use transport_webrtc::WebRtcConfig;

use crate::logging::{LogConfig, LogLevel};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read media profile {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid media profile {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Invalid(#[from] SessionError),
}

#[derive(Parser, Debug)]
#[command(
    name = "relay-dial",
    about = "Join a media relay channel and print its session lifecycle",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "RELAY_ENDPOINT",
        help = "Signaling endpoint (ws, wss, http or https)"
    )]
    pub endpoint: String,

    #[arg(
        long = "fallback-endpoint",
        value_name = "URL",
        help = "Tried in order when the endpoint cannot be reached; repeatable"
    )]
    pub fallback_endpoints: Vec<String>,

    #[arg(long, env = "RELAY_CHANNEL", help = "Channel to join")]
    pub channel: String,

    #[arg(long, env = "RELAY_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "RELAY_BUNDLE_ID")]
    pub bundle_id: Option<String>,

    #[arg(
        long,
        value_name = "JSON",
        value_parser = parse_json,
        env = "RELAY_METADATA",
        help = "Opaque metadata forwarded to the relay with the connect message"
    )]
    pub metadata: Option<Value>,

    #[arg(long, value_name = "JSON", value_parser = parse_json)]
    pub notify_metadata: Option<Value>,

    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Give up if the session is not connected within this many seconds"
    )]
    pub timeout: u64,

    #[arg(long, help = "Send the first SDP offer instead of waiting for the relay's")]
    pub offerer: bool,

    #[command(flatten)]
    pub media: MediaArgs,

    #[command(flatten)]
    pub ice: IceArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|err| format!("not valid JSON: {err}"))
}

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum RoleArg {
    #[default]
    Sendrecv,
    Sendonly,
    Recvonly,
}

impl From<RoleArg> for Direction {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Sendrecv => Direction::SendRecv,
            RoleArg::Sendonly => Direction::SendOnly,
            RoleArg::Recvonly => Direction::RecvOnly,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct MediaArgs {
    #[arg(
        long,
        value_name = "PATH",
        env = "RELAY_PROFILE",
        help = "TOML media profile; replaces the media flags below",
        conflicts_with_all = [
            "role", "no_audio", "no_video", "video_codecs", "audio_codec",
            "data_channels", "data_only", "simulcast", "multistream",
            "data_channel_signaling", "ignore_disconnect_websocket",
        ]
    )]
    pub profile: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = RoleArg::Sendrecv)]
    pub role: RoleArg,

    #[arg(long)]
    pub no_audio: bool,

    #[arg(long)]
    pub no_video: bool,

    #[arg(long = "video-codec", value_name = "CODEC", help = "Preferred video codec; repeat to rank several")]
    pub video_codecs: Vec<String>,

    #[arg(long, value_name = "CODEC")]
    pub audio_codec: Option<String>,

    #[arg(long = "data-channel", value_name = "LABEL")]
    pub data_channels: Vec<String>,

    #[arg(long, help = "Open data channels only, no audio or video")]
    pub data_only: bool,

    #[arg(long)]
    pub simulcast: bool,

    #[arg(long)]
    pub multistream: bool,

    #[arg(long, help = "Ask the relay to move signaling onto data channels")]
    pub data_channel_signaling: bool,

    #[arg(
        long,
        requires = "data_channel_signaling",
        help = "Stay connected when the websocket closes after the switch"
    )]
    pub ignore_disconnect_websocket: bool,
}

impl MediaArgs {
    pub fn configuration(&self) -> Result<Configuration, ConfigError> {
        if let Some(path) = &self.profile {
            return load_profile(path);
        }
        let mut builder = Configuration::builder().role(self.role.into());
        builder = if self.data_only {
            builder.data_only()
        } else {
            builder.audio(!self.no_audio).video(!self.no_video)
        };
        if !self.video_codecs.is_empty() {
            builder = builder.video_codecs(self.video_codecs.iter().cloned());
        }
        if let Some(codec) = &self.audio_codec {
            builder = builder.audio_codec(codec.clone());
        }
        if self.simulcast {
            builder = builder.simulcast(true);
        }
        if self.multistream {
            builder = builder.multistream(true);
        }
        if self.data_channel_signaling {
            builder = builder.data_channel_signaling(true);
        }
        if self.ignore_disconnect_websocket {
            builder = builder.ignore_disconnect_websocket(true);
        }
        for label in &self.data_channels {
            builder = builder.data_channel(DataChannelRequest::reliable(label.clone()));
        }
        Ok(builder.build()?)
    }
}

/// Reads a TOML media profile into a validated [`Configuration`].
pub fn load_profile(path: &Path) -> Result<Configuration, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Args, Debug, Clone, Default)]
pub struct IceArgs {
    #[arg(
        long = "ice-server",
        value_name = "URL",
        help = "STUN/TURN url used until the relay supplies its own; repeatable"
    )]
    pub ice_servers: Vec<String>,

    #[arg(long, help = "Skip the default public STUN server")]
    pub no_stun: bool,
}

impl IceArgs {
    pub fn webrtc_config(&self) -> WebRtcConfig {
        let mut builder = WebRtcConfig::builder();
        if self.no_stun || !self.ice_servers.is_empty() {
            builder = builder.without_ice_servers();
        }
        for url in &self.ice_servers {
            builder = builder.ice_server(IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            });
        }
        builder.build()
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "RELAY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "RELAY_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn identity(&self) -> SessionIdentity {
        let mut identity = SessionIdentity::new(self.endpoint.clone(), self.channel.clone());
        for endpoint in &self.fallback_endpoints {
            identity = identity.with_fallback_endpoint(endpoint.clone());
        }
        if let Some(client_id) = &self.client_id {
            identity = identity.with_client_id(client_id.clone());
        }
        if let Some(bundle_id) = &self.bundle_id {
            identity = identity.with_bundle_id(bundle_id.clone());
        }
        if let Some(metadata) = &self.metadata {
            identity = identity.with_metadata(metadata.clone());
        }
        if let Some(metadata) = &self.notify_metadata {
            identity = identity.with_notify_metadata(metadata.clone());
        }
        identity
    }

    pub fn session_params(&self) -> Result<SessionParams, ConfigError> {
        let configuration = Arc::new(self.media.configuration()?);
        let negotiation = if self.offerer {
            NegotiationRole::Offerer
        } else {
            NegotiationRole::Answerer
        };
        Ok(SessionParams::new(configuration, self.identity())
            .with_timeout(Duration::from_secs(self.timeout))
            .with_negotiation(negotiation))
    }
}
