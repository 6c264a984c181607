//! WebRTC media transport for relay sessions, built on webrtc-rs.
//!
//! One peer connection per session. Transceivers and data channels are set
//! up from the session [`Configuration`] before the first negotiation;
//! connection state, local candidates and remote tracks are reported through
//! the attached [`MediaEventSink`].
//!
//! Data channels whose label does not start with `#` belong to the relay
//! (`signaling`, `notify`, `push`, `stats`); their messages are forwarded to
//! the session as [`MediaEvent::SignalingMessage`].

mod codecs;
mod config;
mod sdp;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_session::{
    Candidate, Configuration, Description, Direction, IceConfig, MediaEvent, MediaEventSink,
    MediaTransport, NegotiationError, Reliability, SdpKind, Track, TrackKind,
};
use serde_json::Value;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

pub use codecs::media_engine;
pub use config::{
    DEFAULT_STUN_SERVER, DISABLE_STUN_ENV, IceTimeouts, WebRtcConfig, WebRtcConfigBuilder,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebRtcError {
    #[error("webrtc setup failed: {0}")]
    Setup(String),
    #[error("unsupported codec {0}")]
    UnsupportedCodec(String),
    #[error("no data channel labelled {0}")]
    UnknownDataChannel(String),
    #[error("data channel send failed: {0}")]
    DataChannel(String),
    #[error("media transport is closed")]
    Closed,
}

pub(crate) fn to_setup_error<E: fmt::Display>(err: E) -> WebRtcError {
    WebRtcError::Setup(err.to_string())
}

fn build_api(configuration: &Configuration, config: &WebRtcConfig) -> Result<API, WebRtcError> {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(config.ice_timeouts.disconnected),
        Some(config.ice_timeouts.failed),
        Some(config.ice_timeouts.keepalive),
    );
    setting.set_include_loopback_candidate(config.include_loopback);

    let mut media_engine = codecs::media_engine(configuration)?;
    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn transceiver_direction(direction: Direction) -> RTCRtpTransceiverDirection {
    match (direction.sends(), direction.receives()) {
        (true, true) => RTCRtpTransceiverDirection::Sendrecv,
        (true, false) => RTCRtpTransceiverDirection::Sendonly,
        (false, true) => RTCRtpTransceiverDirection::Recvonly,
        (false, false) => RTCRtpTransceiverDirection::Inactive,
    }
}

/// Application channels are `#`-prefixed; everything else is the relay's.
fn is_relay_label(label: &str) -> bool {
    !label.starts_with('#')
}

fn data_channel_init(reliability: &Reliability) -> RTCDataChannelInit {
    match *reliability {
        Reliability::Reliable { ordered } => RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        },
        Reliability::MaxRetransmits { count } => RTCDataChannelInit {
            max_retransmits: Some(count),
            ..Default::default()
        },
        Reliability::MaxPacketLifeTime { millis } => RTCDataChannelInit {
            max_packet_life_time: Some(millis),
            ..Default::default()
        },
    }
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
    match kind {
        RTPCodecType::Audio => TrackKind::Audio,
        _ => TrackKind::Video,
    }
}

type SharedSink = Arc<Mutex<Option<MediaEventSink>>>;

fn emit(sink: &SharedSink, event: MediaEvent) {
    if let Some(sink) = sink.lock().as_ref() {
        sink.emit(event);
    }
}

struct RemoteTrack {
    track: Track,
    remote: Arc<TrackRemote>,
}

type RemoteTracks = Arc<Mutex<HashMap<String, RemoteTrack>>>;
type DataChannels = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

pub struct WebRtcMediaTransport {
    pc: Arc<RTCPeerConnection>,
    rtc_config: RTCConfiguration,
    sink: SharedSink,
    data_channels: DataChannels,
    remote_tracks: RemoteTracks,
    closed: AtomicBool,
}

impl WebRtcMediaTransport {
    /// Creates the peer connection with transceivers and data channels for
    /// `configuration`.
    pub async fn new(
        configuration: Arc<Configuration>,
        config: WebRtcConfig,
    ) -> Result<Self, WebRtcError> {
        let api = build_api(&configuration, &config)?;
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config.clone())
                .await
                .map_err(to_setup_error)?,
        );

        let direction = transceiver_direction(configuration.role());
        let kinds = [
            (configuration.audio(), RTPCodecType::Audio),
            (configuration.video(), RTPCodecType::Video),
        ];
        for (_, kind) in kinds.into_iter().filter(|(enabled, _)| *enabled) {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(to_setup_error)?;
        }

        let data_channels: DataChannels = Arc::new(Mutex::new(HashMap::new()));
        for request in configuration.data_channels() {
            let channel = pc
                .create_data_channel(&request.label, Some(data_channel_init(&request.reliability)))
                .await
                .map_err(to_setup_error)?;
            let label = request.label.clone();
            channel.on_open(Box::new(move || {
                let label = label.clone();
                Box::pin(async move {
                    tracing::debug!(target = "webrtc", label = %label, "data channel open");
                })
            }));
            data_channels.lock().insert(request.label.clone(), channel);
        }

        let transport = Self {
            pc,
            rtc_config,
            sink: Arc::new(Mutex::new(None)),
            data_channels,
            remote_tracks: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        };
        transport.register_callbacks();
        tracing::debug!(
            target = "webrtc",
            audio = configuration.audio(),
            video = configuration.video(),
            data_channels = configuration.data_channels().len(),
            role = configuration.role().as_str(),
            "peer connection created"
        );
        Ok(transport)
    }

    fn register_callbacks(&self) {
        let sink = Arc::clone(&self.sink);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                    match state {
                        RTCPeerConnectionState::Connected => emit(&sink, MediaEvent::Connected),
                        RTCPeerConnectionState::Disconnected => {
                            emit(&sink, MediaEvent::Disconnected)
                        }
                        RTCPeerConnectionState::Failed => emit(
                            &sink,
                            MediaEvent::Error("peer connection failed".to_string()),
                        ),
                        _ => {}
                    }
                })
            }));

        let sink = Arc::clone(&self.sink);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!(target = "webrtc", "local candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emit(
                        &sink,
                        MediaEvent::LocalCandidate(Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                    ),
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "local candidate not serializable")
                    }
                }
            })
        }));

        let sink = Arc::clone(&self.sink);
        let tracks = Arc::clone(&self.remote_tracks);
        self.pc.on_track(Box::new(
            move |remote: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = Arc::clone(&sink);
                let tracks = Arc::clone(&tracks);
                Box::pin(async move {
                    let track = Track {
                        id: remote.id(),
                        stream_id: remote.stream_id(),
                        kind: track_kind(remote.kind()),
                    };
                    let added = tracks
                        .lock()
                        .insert(
                            track.id.clone(),
                            RemoteTrack {
                                track: track.clone(),
                                remote,
                            },
                        )
                        .is_none();
                    if added {
                        tracing::debug!(
                            target = "webrtc",
                            track_id = %track.id,
                            stream_id = %track.stream_id,
                            "remote track added"
                        );
                        emit(&sink, MediaEvent::TrackAdded(track));
                    }
                })
            },
        ));

        let sink = Arc::clone(&self.sink);
        let channels = Arc::clone(&self.data_channels);
        self.pc
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let sink = Arc::clone(&sink);
                let channels = Arc::clone(&channels);
                Box::pin(async move {
                    let label = channel.label().to_string();
                    tracing::debug!(target = "webrtc", label = %label, "remote data channel");
                    if is_relay_label(&label) {
                        forward_relay_messages(&channel, sink);
                    }
                    channels.lock().insert(label, channel);
                })
            }));
    }

    async fn send_relay_frame(&self, label: &str, frame: Bytes) -> Result<(), WebRtcError> {
        let sent = self.send_data(label, &frame).await?;
        tracing::trace!(target = "webrtc", label = %label, bytes = sent, "relay frame sent");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    /// Drops tracks the latest remote description no longer announces.
    fn reconcile_remote_tracks(&self, remote_sdp: &str) {
        let announced = sdp::announced_tracks(remote_sdp);
        let removed: Vec<Track> = {
            let mut tracks = self.remote_tracks.lock();
            let gone: Vec<String> = tracks
                .keys()
                .filter(|id| !announced.contains(*id))
                .cloned()
                .collect();
            gone.iter()
                .filter_map(|id| tracks.remove(id))
                .map(|entry| entry.track)
                .collect()
        };
        for track in removed {
            tracing::debug!(target = "webrtc", track_id = %track.id, "remote track removed");
            emit(&self.sink, MediaEvent::TrackRemoved(track));
        }
    }

    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc)
    }

    pub fn data_channel(&self, label: &str) -> Option<Arc<RTCDataChannel>> {
        self.data_channels.lock().get(label).cloned()
    }

    /// Sends `data` on the data channel labelled `label`.
    pub async fn send_data(&self, label: &str, data: &Bytes) -> Result<usize, WebRtcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WebRtcError::Closed);
        }
        let channel = self
            .data_channel(label)
            .ok_or_else(|| WebRtcError::UnknownDataChannel(label.to_string()))?;
        channel
            .send(data)
            .await
            .map_err(|err| WebRtcError::DataChannel(err.to_string()))
    }

    pub fn remote_track(&self, id: &str) -> Option<Arc<TrackRemote>> {
        self.remote_tracks
            .lock()
            .get(id)
            .map(|entry| Arc::clone(&entry.remote))
    }

    pub fn remote_tracks(&self) -> Vec<Track> {
        self.remote_tracks
            .lock()
            .values()
            .map(|entry| entry.track.clone())
            .collect()
    }
}

#[async_trait]
impl MediaTransport for WebRtcMediaTransport {
    fn attach(&self, sink: MediaEventSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn create_offer(&self) -> Result<Description, NegotiationError> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::CreateOffer(err.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|err| NegotiationError::CreateOffer(err.to_string()))?;
        let sdp = match self.pc.local_description().await {
            Some(local) => local.sdp,
            None => offer.sdp,
        };
        tracing::trace!(target = "webrtc", len = sdp.len(), "local offer set");
        Ok(Description::offer(sdp))
    }

    async fn create_answer(&self) -> Result<Description, NegotiationError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::CreateAnswer(err.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|err| NegotiationError::CreateAnswer(err.to_string()))?;
        let sdp = match self.pc.local_description().await {
            Some(local) => local.sdp,
            None => answer.sdp,
        };
        tracing::trace!(target = "webrtc", len = sdp.len(), "local answer set");
        Ok(Description::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: Description,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(|err| NegotiationError::RemoteDescription(err.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|err| NegotiationError::RemoteDescription(err.to_string()))?;
        self.reconcile_remote_tracks(&description.sdp);
        Ok(())
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| NegotiationError::Candidate(err.to_string()))
    }

    async fn apply_ice_config(&self, config: &IceConfig) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let mut rtc_config = self.rtc_config.clone();
        if !config.servers.is_empty() {
            rtc_config.ice_servers = config.servers.iter().map(config::to_rtc_ice_server).collect();
        }
        if let Some(policy) = config.transport_policy.as_deref() {
            rtc_config.ice_transport_policy = match policy {
                "relay" => RTCIceTransportPolicy::Relay,
                "all" => RTCIceTransportPolicy::All,
                other => {
                    return Err(NegotiationError::IceConfiguration(format!(
                        "unknown transport policy {other}"
                    )));
                }
            };
        }
        tracing::debug!(
            target = "webrtc",
            servers = rtc_config.ice_servers.len(),
            policy = ?rtc_config.ice_transport_policy,
            "applying relay ice configuration"
        );
        self.pc
            .set_configuration(rtc_config)
            .await
            .map_err(|err| NegotiationError::IceConfiguration(err.to_string()))
    }

    async fn send_signaling(&self, label: &str, frame: Bytes) -> Result<(), NegotiationError> {
        self.send_relay_frame(label, frame)
            .await
            .map_err(|err| match err {
                WebRtcError::Closed => NegotiationError::Closed,
                other => NegotiationError::DataChannel(other.to_string()),
            })
    }

    async fn stats(&self) -> Option<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let report = self.pc.get_stats().await;
        let mut entries = serde_json::Map::new();
        for (id, entry) in report.reports {
            match serde_json::to_value(&entry) {
                Ok(value) => {
                    entries.insert(id, value);
                }
                Err(err) => {
                    tracing::warn!(target = "webrtc", id = %id, error = %err, "stats entry not serializable")
                }
            }
        }
        Some(Value::Object(entries))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::warn!(target = "webrtc", error = %err, "peer connection close failed");
        }
        self.data_channels.lock().clear();
        self.remote_tracks.lock().clear();
        tracing::debug!(target = "webrtc", "peer connection closed");
    }
}

fn forward_relay_messages(channel: &Arc<RTCDataChannel>, sink: SharedSink) {
    let label = channel.label().to_string();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let sink = Arc::clone(&sink);
        let label = label.clone();
        Box::pin(async move {
            emit(
                &sink,
                MediaEvent::SignalingMessage {
                    label,
                    frame: message.data,
                },
            );
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_maps_onto_transceiver_direction() {
        assert_eq!(
            transceiver_direction(Direction::SendOnly),
            RTCRtpTransceiverDirection::Sendonly
        );
        assert_eq!(
            transceiver_direction(Direction::RecvOnly),
            RTCRtpTransceiverDirection::Recvonly
        );
        assert_eq!(
            transceiver_direction(Direction::SendRecv),
            RTCRtpTransceiverDirection::Sendrecv
        );
    }

    #[test]
    fn hash_labels_belong_to_the_application() {
        assert!(is_relay_label("signaling"));
        assert!(is_relay_label("stats"));
        assert!(!is_relay_label("#chat"));
    }

    #[test]
    fn reliability_maps_onto_channel_init() {
        let init = data_channel_init(&Reliability::MaxRetransmits { count: 3 });
        assert_eq!(init.max_retransmits, Some(3));
        assert_eq!(init.max_packet_life_time, None);

        let init = data_channel_init(&Reliability::Reliable { ordered: false });
        assert_eq!(init.ordered, Some(false));
    }
}
