use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Media direction, used both for the session role and for data channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
        }
    }

    pub fn sends(&self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    pub fn receives(&self) -> bool {
        matches!(self, Direction::SendRecv | Direction::RecvOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Reliability {
    Reliable {
        #[serde(default = "default_ordered")]
        ordered: bool,
    },
    MaxRetransmits {
        count: u16,
    },
    MaxPacketLifeTime {
        millis: u16,
    },
}

fn default_ordered() -> bool {
    true
}

impl Default for Reliability {
    fn default() -> Self {
        Reliability::Reliable { ordered: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelRequest {
    pub label: String,
    #[serde(default)]
    pub reliability: Reliability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl DataChannelRequest {
    pub fn reliable(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            reliability: Reliability::default(),
            direction: None,
        }
    }

    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }
}

const SIMULCAST_RIDS: [&str; 3] = ["r0", "r1", "r2"];

/// Validated, immutable description of what a session sends and receives.
///
/// Build one with [`Configuration::builder`] or deserialize it; both paths go
/// through the same validation, so a `Configuration` value is always valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConfigurationBuilder", into = "ConfigurationBuilder")]
pub struct Configuration {
    audio: bool,
    video: bool,
    data_only: bool,
    role: Direction,
    video_codecs: Vec<String>,
    audio_codec: Option<String>,
    audio_bit_rate: Option<u32>,
    video_bit_rate: Option<u32>,
    simulcast: bool,
    simulcast_rid: Option<String>,
    multistream: Option<bool>,
    spotlight: Option<u32>,
    data_channels: Vec<DataChannelRequest>,
    data_channel_signaling: Option<bool>,
    ignore_disconnect_websocket: Option<bool>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    pub fn audio(&self) -> bool {
        self.audio
    }

    pub fn video(&self) -> bool {
        self.video
    }

    pub fn data_only(&self) -> bool {
        self.data_only
    }

    pub fn role(&self) -> Direction {
        self.role
    }

    /// Ordered video codec preference, most preferred first.
    pub fn video_codecs(&self) -> &[String] {
        &self.video_codecs
    }

    pub fn audio_codec(&self) -> Option<&str> {
        self.audio_codec.as_deref()
    }

    pub fn audio_bit_rate(&self) -> Option<u32> {
        self.audio_bit_rate
    }

    pub fn video_bit_rate(&self) -> Option<u32> {
        self.video_bit_rate
    }

    pub fn simulcast(&self) -> bool {
        self.simulcast
    }

    pub fn simulcast_rid(&self) -> Option<&str> {
        self.simulcast_rid.as_deref()
    }

    pub fn multistream(&self) -> Option<bool> {
        self.multistream
    }

    pub fn spotlight(&self) -> Option<u32> {
        self.spotlight
    }

    pub fn data_channels(&self) -> &[DataChannelRequest] {
        &self.data_channels
    }

    /// Ask the relay to move signaling onto data channels once connected.
    /// `None` leaves the choice to the relay.
    pub fn data_channel_signaling(&self) -> Option<bool> {
        self.data_channel_signaling
    }

    pub fn ignore_disconnect_websocket(&self) -> Option<bool> {
        self.ignore_disconnect_websocket
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigurationBuilder {
    audio: bool,
    video: bool,
    data_only: bool,
    role: Direction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    video_codecs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_bit_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_bit_rate: Option<u32>,
    simulcast: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    simulcast_rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    multistream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spotlight: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    data_channels: Vec<DataChannelRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_channel_signaling: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ignore_disconnect_websocket: Option<bool>,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            data_only: false,
            role: Direction::SendRecv,
            video_codecs: Vec::new(),
            audio_codec: None,
            audio_bit_rate: None,
            video_bit_rate: None,
            simulcast: false,
            simulcast_rid: None,
            multistream: None,
            spotlight: None,
            data_channels: Vec::new(),
            data_channel_signaling: None,
            ignore_disconnect_websocket: None,
        }
    }
}

impl ConfigurationBuilder {
    pub fn audio(mut self, enabled: bool) -> Self {
        self.audio = enabled;
        self
    }

    pub fn video(mut self, enabled: bool) -> Self {
        self.video = enabled;
        self
    }

    /// Disables audio and video; the session carries data channels only.
    pub fn data_only(mut self) -> Self {
        self.data_only = true;
        self.audio = false;
        self.video = false;
        self
    }

    pub fn role(mut self, role: Direction) -> Self {
        self.role = role;
        self
    }

    pub fn video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codecs.push(codec.into());
        self
    }

    pub fn video_codecs<I, S>(mut self, codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.video_codecs = codecs.into_iter().map(Into::into).collect();
        self
    }

    pub fn audio_codec(mut self, codec: impl Into<String>) -> Self {
        self.audio_codec = Some(codec.into());
        self
    }

    pub fn audio_bit_rate(mut self, kbps: u32) -> Self {
        self.audio_bit_rate = Some(kbps);
        self
    }

    pub fn video_bit_rate(mut self, kbps: u32) -> Self {
        self.video_bit_rate = Some(kbps);
        self
    }

    pub fn simulcast(mut self, enabled: bool) -> Self {
        self.simulcast = enabled;
        self
    }

    pub fn simulcast_rid(mut self, rid: impl Into<String>) -> Self {
        self.simulcast_rid = Some(rid.into());
        self
    }

    pub fn multistream(mut self, enabled: bool) -> Self {
        self.multistream = Some(enabled);
        self
    }

    pub fn spotlight(mut self, focused: u32) -> Self {
        self.spotlight = Some(focused);
        self
    }

    pub fn data_channel(mut self, request: DataChannelRequest) -> Self {
        self.data_channels.push(request);
        self
    }

    pub fn data_channel_signaling(mut self, enabled: bool) -> Self {
        self.data_channel_signaling = Some(enabled);
        self
    }

    /// Keep the session alive when the websocket drops after the switch to
    /// data channel signaling.
    pub fn ignore_disconnect_websocket(mut self, ignore: bool) -> Self {
        self.ignore_disconnect_websocket = Some(ignore);
        self
    }

    pub fn build(self) -> Result<Configuration, SessionError> {
        self.validate()?;
        Ok(Configuration {
            audio: self.audio,
            video: self.video,
            data_only: self.data_only,
            role: self.role,
            video_codecs: self.video_codecs,
            audio_codec: self.audio_codec,
            audio_bit_rate: self.audio_bit_rate,
            video_bit_rate: self.video_bit_rate,
            simulcast: self.simulcast,
            simulcast_rid: self.simulcast_rid,
            multistream: self.multistream,
            spotlight: self.spotlight,
            data_channels: self.data_channels,
            data_channel_signaling: self.data_channel_signaling,
            ignore_disconnect_websocket: self.ignore_disconnect_websocket,
        })
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.data_only {
            if self.audio || self.video {
                return Err(invalid("data-only sessions cannot enable audio or video"));
            }
            if self.data_channels.is_empty() {
                return Err(invalid("data-only sessions need at least one data channel"));
            }
        } else if !self.audio && !self.video {
            return Err(invalid(
                "at least one of audio or video must be enabled unless data-only",
            ));
        }

        if self.simulcast && !self.video {
            return Err(invalid("simulcast requires video"));
        }
        if let Some(rid) = &self.simulcast_rid {
            if !self.simulcast {
                return Err(invalid("simulcast_rid requires simulcast"));
            }
            if !SIMULCAST_RIDS.contains(&rid.as_str()) {
                return Err(invalid(format!("unknown simulcast rid {rid:?}")));
            }
        }

        let mut seen = HashSet::new();
        for codec in &self.video_codecs {
            let name = codec.trim();
            if name.is_empty() {
                return Err(invalid("video codec names must not be empty"));
            }
            if !seen.insert(name.to_ascii_uppercase()) {
                return Err(invalid(format!("duplicate video codec {name}")));
            }
        }
        if matches!(&self.audio_codec, Some(codec) if codec.trim().is_empty()) {
            return Err(invalid("audio codec name must not be empty"));
        }

        if self.audio_bit_rate == Some(0) || self.video_bit_rate == Some(0) {
            return Err(invalid("bit rates must be positive"));
        }
        if self.spotlight == Some(0) {
            return Err(invalid("spotlight must focus at least one participant"));
        }

        if self.ignore_disconnect_websocket == Some(true)
            && self.data_channel_signaling == Some(false)
        {
            return Err(invalid(
                "ignore_disconnect_websocket requires data channel signaling",
            ));
        }

        let mut labels = HashSet::new();
        for channel in &self.data_channels {
            if channel.label.trim().is_empty() {
                return Err(invalid("data channel labels must not be empty"));
            }
            if !labels.insert(channel.label.as_str()) {
                return Err(invalid(format!(
                    "duplicate data channel label {}",
                    channel.label
                )));
            }
        }
        Ok(())
    }
}

fn invalid(detail: impl Into<String>) -> SessionError {
    SessionError::ConfigurationInvalid(detail.into())
}

impl TryFrom<ConfigurationBuilder> for Configuration {
    type Error = SessionError;

    fn try_from(builder: ConfigurationBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

impl From<Configuration> for ConfigurationBuilder {
    fn from(config: Configuration) -> Self {
        Self {
            audio: config.audio,
            video: config.video,
            data_only: config.data_only,
            role: config.role,
            video_codecs: config.video_codecs,
            audio_codec: config.audio_codec,
            audio_bit_rate: config.audio_bit_rate,
            video_bit_rate: config.video_bit_rate,
            simulcast: config.simulcast,
            simulcast_rid: config.simulcast_rid,
            multistream: config.multistream,
            spotlight: config.spotlight,
            data_channels: config.data_channels,
            data_channel_signaling: config.data_channel_signaling,
            ignore_disconnect_websocket: config.ignore_disconnect_websocket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_builder_enables_audio_and_video() {
        let config = Configuration::builder().build().unwrap();
        assert!(config.audio());
        assert!(config.video());
        assert_eq!(config.role(), Direction::SendRecv);
        assert!(config.data_channels().is_empty());
    }

    #[test]
    fn rejects_session_without_media() {
        let err = Configuration::builder()
            .audio(false)
            .video(false)
            .build()
            .unwrap_err();
        assert!(matches!(err, SessionError::ConfigurationInvalid(_)));
    }

    #[test]
    fn data_only_requires_a_channel() {
        assert!(Configuration::builder().data_only().build().is_err());

        let config = Configuration::builder()
            .data_only()
            .data_channel(DataChannelRequest::reliable("#chat"))
            .build()
            .unwrap();
        assert!(config.data_only());
        assert!(!config.audio());
        assert!(!config.video());
    }

    #[test]
    fn data_only_cannot_reenable_media() {
        let err = Configuration::builder()
            .data_only()
            .audio(true)
            .data_channel(DataChannelRequest::reliable("#chat"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("data-only"));
    }

    #[test]
    fn simulcast_needs_video() {
        assert!(
            Configuration::builder()
                .video(false)
                .simulcast(true)
                .build()
                .is_err()
        );
        assert!(Configuration::builder().simulcast_rid("r1").build().is_err());
        assert!(
            Configuration::builder()
                .simulcast(true)
                .simulcast_rid("r7")
                .build()
                .is_err()
        );
        let config = Configuration::builder()
            .simulcast(true)
            .simulcast_rid("r1")
            .build()
            .unwrap();
        assert_eq!(config.simulcast_rid(), Some("r1"));
    }

    #[test]
    fn duplicate_labels_and_codecs_are_rejected() {
        let err = Configuration::builder()
            .data_channel(DataChannelRequest::reliable("#a"))
            .data_channel(DataChannelRequest::reliable("#a"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate data channel"));

        let err = Configuration::builder()
            .video_codecs(["VP9", "vp9"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate video codec"));
    }

    #[test]
    fn websocket_can_only_be_dropped_with_data_channel_signaling() {
        assert!(
            Configuration::builder()
                .data_channel_signaling(false)
                .ignore_disconnect_websocket(true)
                .build()
                .is_err()
        );
        let config = Configuration::builder()
            .data_channel_signaling(true)
            .ignore_disconnect_websocket(true)
            .build()
            .unwrap();
        assert_eq!(config.data_channel_signaling(), Some(true));
        assert_eq!(config.ignore_disconnect_websocket(), Some(true));
    }

    #[test]
    fn zero_bit_rate_is_rejected() {
        assert!(Configuration::builder().video_bit_rate(0).build().is_err());
        assert!(Configuration::builder().spotlight(0).build().is_err());
    }

    #[test]
    fn deserialization_goes_through_validation() {
        let config: Configuration = toml::from_str(
            r##"
            video = false
            audio_codec = "OPUS"
            role = "recvonly"

            [[data_channels]]
            label = "#telemetry"
            reliability = { mode = "max_retransmits", count = 0 }
            direction = "recvonly"
            "##,
        )
        .unwrap();
        assert!(!config.video());
        assert_eq!(config.role(), Direction::RecvOnly);
        assert_eq!(
            config.data_channels()[0].reliability,
            Reliability::MaxRetransmits { count: 0 }
        );

        let invalid = toml::from_str::<Configuration>("audio = false\nvideo = false\n");
        assert!(invalid.is_err());
    }

    #[test]
    fn unknown_profile_keys_are_rejected() {
        assert!(toml::from_str::<Configuration>("vidoe = true\n").is_err());
    }
}
