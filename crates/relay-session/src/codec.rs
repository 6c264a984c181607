//! Handshake message codec.
//!
//! Frames are JSON objects tagged by `type`. Inbound decoding is lenient
//! about message kinds (unknown kinds decode to [`Inbound::Unknown`]) and
//! strict about payloads of known kinds.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{Configuration, Direction, Reliability};
use crate::identity::SessionIdentity;
use crate::transport::{Candidate, IceConfig};

pub const SDK_TYPE: &str = "relay-session-rs";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OfferMessage {
    pub sdp: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub config: Option<IceConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SdpMessage {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PingMessage {
    #[serde(default)]
    pub stats: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RedirectMessage {
    pub location: String,
}

/// `reason` is whatever the relay put there, rendered as text when it is not
/// a string.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RejectMessage {
    pub reason: Option<String>,
}

/// The relay moved signaling onto the peer connection's data channels.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SwitchedMessage {
    #[serde(default)]
    pub ignore_disconnect_websocket: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct PushMessage {
    data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Offer(OfferMessage),
    Answer(SdpMessage),
    Candidate(Candidate),
    Update(SdpMessage),
    ReOffer(SdpMessage),
    /// The whole message minus its `type` field.
    Notify(Value),
    Push(Value),
    Ping(PingMessage),
    Redirect(RedirectMessage),
    Reject(RejectMessage),
    Switched(SwitchedMessage),
    ReqStats,
    Unknown(String),
}

impl Inbound {
    pub fn kind(&self) -> &str {
        match self {
            Inbound::Offer(_) => "offer",
            Inbound::Answer(_) => "answer",
            Inbound::Candidate(_) => "candidate",
            Inbound::Update(_) => "update",
            Inbound::ReOffer(_) => "re-offer",
            Inbound::Notify(_) => "notify",
            Inbound::Push(_) => "push",
            Inbound::Ping(_) => "ping",
            Inbound::Redirect(_) => "redirect",
            Inbound::Reject(_) => "reject",
            Inbound::Switched(_) => "switched",
            Inbound::ReqStats => "req-stats",
            Inbound::Unknown(kind) => kind,
        }
    }
}

pub fn decode(frame: &[u8]) -> Result<Inbound, CodecError> {
    let value: Value = serde_json::from_slice(frame).map_err(CodecError::InvalidJson)?;
    let Value::Object(mut object) = value else {
        return Err(CodecError::NotAnObject);
    };
    let kind = match object.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(CodecError::MissingType),
    };

    let message = match kind.as_str() {
        "offer" => Inbound::Offer(payload(&kind, object)?),
        "answer" => Inbound::Answer(payload(&kind, object)?),
        "candidate" => Inbound::Candidate(payload(&kind, object)?),
        "update" => Inbound::Update(payload(&kind, object)?),
        "re-offer" => Inbound::ReOffer(payload(&kind, object)?),
        "notify" => Inbound::Notify(Value::Object(object)),
        "push" => Inbound::Push(payload::<PushMessage>(&kind, object)?.data),
        "ping" => Inbound::Ping(payload(&kind, object)?),
        "redirect" => Inbound::Redirect(payload(&kind, object)?),
        "reject" | "error" => Inbound::Reject(RejectMessage {
            reason: reject_reason(object.remove("reason")),
        }),
        "switched" => Inbound::Switched(payload(&kind, object)?),
        "req-stats" => Inbound::ReqStats,
        _ => Inbound::Unknown(kind),
    };
    Ok(message)
}

// A rejection always ends the session, so its reason is never grounds for
// treating the frame as malformed.
fn reject_reason(reason: Option<Value>) -> Option<String> {
    match reason? {
        Value::Null => None,
        Value::String(reason) => Some(reason),
        other => Some(other.to_string()),
    }
}

fn payload<T: DeserializeOwned>(kind: &str, object: Map<String, Value>) -> Result<T, CodecError> {
    serde_json::from_value(Value::Object(object)).map_err(|source| CodecError::Malformed {
        kind: kind.to_string(),
        source,
    })
}

/// Audio or video section of the connect message: `false` when disabled,
/// `true` when enabled without parameters, an object otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSetting {
    Disabled,
    Enabled {
        codec_type: Option<String>,
        bit_rate: Option<u32>,
    },
}

impl Serialize for MediaSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MediaSetting::Disabled => serializer.serialize_bool(false),
            MediaSetting::Enabled {
                codec_type: None,
                bit_rate: None,
            } => serializer.serialize_bool(true),
            MediaSetting::Enabled {
                codec_type,
                bit_rate,
            } => {
                let mut map = serializer.serialize_map(None)?;
                if let Some(codec_type) = codec_type {
                    map.serialize_entry("codec_type", codec_type)?;
                }
                if let Some(bit_rate) = bit_rate {
                    map.serialize_entry("bit_rate", bit_rate)?;
                }
                map.end()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataChannelSetting {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectMessage {
    pub role: Direction,
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signaling_notify_metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multistream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotlight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulcast: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulcast_rid: Option<String>,
    pub audio: MediaSetting,
    pub video: MediaSetting,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_channels: Vec<DataChannelSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_channel_signaling: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_disconnect_websocket: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    pub sdk_type: &'static str,
    pub sdk_version: &'static str,
}

impl ConnectMessage {
    pub fn new(
        configuration: &Configuration,
        identity: &SessionIdentity,
        sdp: Option<String>,
    ) -> Self {
        let audio = if configuration.audio() {
            MediaSetting::Enabled {
                codec_type: configuration.audio_codec().map(str::to_string),
                bit_rate: configuration.audio_bit_rate(),
            }
        } else {
            MediaSetting::Disabled
        };
        let video = if configuration.video() {
            MediaSetting::Enabled {
                codec_type: configuration.video_codecs().first().cloned(),
                bit_rate: configuration.video_bit_rate(),
            }
        } else {
            MediaSetting::Disabled
        };
        let data_channels = configuration
            .data_channels()
            .iter()
            .map(|request| {
                let (ordered, max_retransmits, max_packet_life_time) = match request.reliability
                {
                    Reliability::Reliable { ordered } => (Some(ordered), None, None),
                    Reliability::MaxRetransmits { count } => (None, Some(count), None),
                    Reliability::MaxPacketLifeTime { millis } => (None, None, Some(millis)),
                };
                DataChannelSetting {
                    label: request.label.clone(),
                    direction: request.direction,
                    ordered,
                    max_retransmits,
                    max_packet_life_time,
                }
            })
            .collect();

        Self {
            role: configuration.role(),
            channel_id: identity.channel_id.clone(),
            client_id: identity.client_id.clone(),
            bundle_id: identity.bundle_id.clone(),
            metadata: identity.metadata.clone(),
            signaling_notify_metadata: identity.notify_metadata.clone(),
            multistream: configuration.multistream(),
            spotlight: configuration.spotlight(),
            simulcast: configuration.simulcast().then_some(true),
            simulcast_rid: configuration.simulcast_rid().map(str::to_string),
            audio,
            video,
            data_channels,
            data_channel_signaling: configuration.data_channel_signaling(),
            ignore_disconnect_websocket: configuration.ignore_disconnect_websocket(),
            sdp,
            sdk_type: SDK_TYPE,
            sdk_version: SDK_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
    Connect(ConnectMessage),
    Answer {
        sdp: String,
    },
    ReAnswer {
        sdp: String,
    },
    Update {
        sdp: String,
    },
    Candidate(Candidate),
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<Value>,
    },
    Disconnect {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Reply to `req-stats` on the `stats` data channel.
    Stats {
        reports: Value,
    },
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Connect(_) => "connect",
            Outbound::Answer { .. } => "answer",
            Outbound::ReAnswer { .. } => "re-answer",
            Outbound::Update { .. } => "update",
            Outbound::Candidate(_) => "candidate",
            Outbound::Pong { .. } => "pong",
            Outbound::Disconnect { .. } => "disconnect",
            Outbound::Stats { .. } => "stats",
        }
    }
}

pub fn encode(message: &Outbound) -> Result<Bytes, CodecError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataChannelRequest;
    use serde_json::json;

    fn to_value(message: &Outbound) -> Value {
        serde_json::from_slice(&encode(message).unwrap()).unwrap()
    }

    #[test]
    fn decodes_offer_with_relay_ice_config() {
        let frame = json!({
            "type": "offer",
            "sdp": "v=0\r\n",
            "client_id": "c1",
            "connection_id": "conn-1",
            "config": {
                "iceServers": [{"urls": ["turn:turn.example:3478"], "username": "u", "credential": "p"}],
                "iceTransportPolicy": "relay"
            }
        });
        let Inbound::Offer(offer) = decode(frame.to_string().as_bytes()).unwrap() else {
            panic!("expected offer");
        };
        assert_eq!(offer.connection_id.as_deref(), Some("conn-1"));
        let config = offer.config.unwrap();
        assert_eq!(config.servers[0].urls, vec!["turn:turn.example:3478"]);
        assert_eq!(config.transport_policy.as_deref(), Some("relay"));
    }

    #[test]
    fn notify_payload_excludes_type() {
        let message = decode(br#"{"type":"notify","event_type":"connection.created","n":2.5}"#).unwrap();
        assert_eq!(
            message,
            Inbound::Notify(json!({"event_type": "connection.created", "n": 2.5}))
        );
    }

    #[test]
    fn push_payload_is_the_data_field() {
        let message = decode(br#"{"type":"push","data":{"n":1}}"#).unwrap();
        assert_eq!(message, Inbound::Push(json!({"n": 1})));
    }

    #[test]
    fn error_is_an_alias_of_reject() {
        let message = decode(br#"{"type":"error","reason":"quota"}"#).unwrap();
        assert_eq!(
            message,
            Inbound::Reject(RejectMessage {
                reason: Some("quota".into())
            })
        );
    }

    #[test]
    fn reject_reason_of_any_shape_is_kept() {
        let message = decode(br#"{"type":"reject","reason":{"code":4001,"text":"kicked"}}"#).unwrap();
        let Inbound::Reject(RejectMessage { reason: Some(reason) }) = message else {
            panic!("expected a reject with a reason, got {message:?}");
        };
        assert_eq!(
            serde_json::from_str::<Value>(&reason).unwrap(),
            json!({"code": 4001, "text": "kicked"})
        );
        assert_eq!(
            decode(br#"{"type":"error","reason":503}"#).unwrap(),
            Inbound::Reject(RejectMessage {
                reason: Some("503".into())
            })
        );
        assert_eq!(
            decode(br#"{"type":"reject","reason":null}"#).unwrap(),
            Inbound::Reject(RejectMessage::default())
        );
    }

    #[test]
    fn switched_carries_the_websocket_flag() {
        let message = decode(br#"{"type":"switched","ignore_disconnect_websocket":true}"#).unwrap();
        assert_eq!(
            message,
            Inbound::Switched(SwitchedMessage {
                ignore_disconnect_websocket: true
            })
        );
        assert_eq!(
            decode(br#"{"type":"switched"}"#).unwrap(),
            Inbound::Switched(SwitchedMessage::default())
        );
        assert_eq!(decode(br#"{"type":"req-stats"}"#).unwrap(), Inbound::ReqStats);
    }

    #[test]
    fn unknown_kinds_are_not_errors() {
        let message = decode(br#"{"type":"close","code":1000}"#).unwrap();
        assert_eq!(message, Inbound::Unknown("close".into()));
    }

    #[test]
    fn malformed_known_kind_is_an_error() {
        let err = decode(br#"{"type":"offer","sdp":42}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { ref kind, .. } if kind == "offer"));

        let err = decode(br#"{"type":"candidate"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn frames_without_type_are_rejected() {
        assert!(matches!(
            decode(br#"{"sdp":"x"}"#),
            Err(CodecError::MissingType)
        ));
        assert!(matches!(decode(b"[1,2]"), Err(CodecError::NotAnObject)));
        assert!(matches!(decode(b"not json"), Err(CodecError::InvalidJson(_))));
    }

    #[test]
    fn connect_message_reflects_configuration() {
        let configuration = Configuration::builder()
            .audio(false)
            .video_codec("VP9")
            .video_codec("H264")
            .video_bit_rate(2500)
            .simulcast(true)
            .data_channel(
                DataChannelRequest::reliable("#metrics")
                    .with_reliability(Reliability::MaxPacketLifeTime { millis: 500 }),
            )
            .build()
            .unwrap();
        let identity = SessionIdentity::new("wss://relay.example/signaling", "room")
            .with_metadata(Value::Null);

        let value = to_value(&Outbound::Connect(ConnectMessage::new(
            &configuration,
            &identity,
            None,
        )));
        assert_eq!(value["type"], "connect");
        assert_eq!(value["role"], "sendrecv");
        assert_eq!(value["channel_id"], "room");
        assert_eq!(value["audio"], json!(false));
        assert_eq!(value["video"], json!({"codec_type": "VP9", "bit_rate": 2500}));
        assert_eq!(value["simulcast"], json!(true));
        assert_eq!(
            value["data_channels"],
            json!([{"label": "#metrics", "max_packet_life_time": 500}])
        );
        assert!(value.as_object().unwrap().contains_key("metadata"));
        assert_eq!(value["metadata"], Value::Null);
        assert!(!value.as_object().unwrap().contains_key("sdp"));
        assert!(!value.as_object().unwrap().contains_key("client_id"));
        assert!(!value.as_object().unwrap().contains_key("data_channel_signaling"));
    }

    #[test]
    fn data_channel_signaling_flags_are_sent_when_set() {
        let configuration = Configuration::builder()
            .data_channel_signaling(true)
            .ignore_disconnect_websocket(false)
            .build()
            .unwrap();
        let identity = SessionIdentity::new("wss://relay.example", "room");
        let value = to_value(&Outbound::Connect(ConnectMessage::new(
            &configuration,
            &identity,
            None,
        )));
        assert_eq!(value["data_channel_signaling"], json!(true));
        assert_eq!(value["ignore_disconnect_websocket"], json!(false));
    }

    #[test]
    fn plain_media_sections_encode_as_true() {
        let configuration = Configuration::builder().build().unwrap();
        let identity = SessionIdentity::new("wss://relay.example", "room");
        let value = to_value(&Outbound::Connect(ConnectMessage::new(
            &configuration,
            &identity,
            Some("v=0".into()),
        )));
        assert_eq!(value["audio"], json!(true));
        assert_eq!(value["video"], json!(true));
        assert_eq!(value["sdp"], "v=0");
    }

    #[test]
    fn outbound_type_tags() {
        assert_eq!(
            to_value(&Outbound::ReAnswer { sdp: "x".into() }),
            json!({"type": "re-answer", "sdp": "x"})
        );
        assert_eq!(
            to_value(&Outbound::Pong { stats: None }),
            json!({"type": "pong"})
        );
        assert_eq!(
            to_value(&Outbound::Candidate(Candidate::new("candidate:1 1 udp 1 0.0.0.0 9 typ host"))),
            json!({"type": "candidate", "candidate": "candidate:1 1 udp 1 0.0.0.0 9 typ host"})
        );
        assert_eq!(
            to_value(&Outbound::Disconnect {
                reason: Some("NO-ERROR".into())
            }),
            json!({"type": "disconnect", "reason": "NO-ERROR"})
        );
    }
}
