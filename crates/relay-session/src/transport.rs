//! Collaborator seams: the signaling channel and the media engine.
//!
//! Both are injected by the caller. The orchestrator drives them from its
//! single event loop and receives their callbacks through the sinks below,
//! which funnel everything into that same loop.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{NegotiationError, TransportError};
use crate::session::SessionEvent;

/// Relay data channel carrying handshake messages after `switched`.
pub const SIGNALING_LABEL: &str = "signaling";
/// Relay data channel carrying `req-stats` and the `stats` reply.
pub const STATS_LABEL: &str = "stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub kind: SdpKind,
    pub sdp: String,
}

impl Description {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A remote media track as reported by the media transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Track {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE settings handed out by the relay along with its offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(rename = "iceServers", default)]
    pub servers: Vec<IceServer>,
    #[serde(
        rename = "iceTransportPolicy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub transport_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message(Bytes),
    Closed(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Connected,
    Disconnected,
    TrackAdded(Track),
    TrackRemoved(Track),
    LocalCandidate(Candidate),
    /// A message on one of the relay's data channels.
    SignalingMessage {
        label: String,
        frame: Bytes,
    },
    Error(String),
}

#[derive(Clone)]
enum SinkTarget<T> {
    Session(mpsc::UnboundedSender<SessionEvent>),
    Detached(mpsc::UnboundedSender<T>),
}

/// Where a signaling transport delivers inbound frames and its close.
///
/// Each sink is bound to one connection attempt; events from an abandoned
/// attempt (after a redirect) are discarded by the session.
#[derive(Clone)]
pub struct SignalingSink {
    generation: u64,
    target: SinkTarget<SignalingEvent>,
}

impl SignalingSink {
    pub(crate) fn session(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            generation,
            target: SinkTarget::Session(tx),
        }
    }

    /// A sink that is not attached to a session, for driving a transport directly.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                generation: 0,
                target: SinkTarget::Detached(tx),
            },
            rx,
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once nobody is listening anymore.
    pub fn deliver(&self, event: SignalingEvent) -> bool {
        match &self.target {
            SinkTarget::Session(tx) => tx
                .send(SessionEvent::Signaling {
                    generation: self.generation,
                    event,
                })
                .is_ok(),
            SinkTarget::Detached(tx) => tx.send(event).is_ok(),
        }
    }

    pub fn message(&self, frame: impl Into<Bytes>) -> bool {
        self.deliver(SignalingEvent::Message(frame.into()))
    }

    pub fn closed(&self, reason: Option<String>) -> bool {
        self.deliver(SignalingEvent::Closed(reason))
    }
}

#[derive(Clone)]
pub struct MediaEventSink {
    target: SinkTarget<MediaEvent>,
}

impl MediaEventSink {
    pub(crate) fn session(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            target: SinkTarget::Session(tx),
        }
    }

    pub fn detached() -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                target: SinkTarget::Detached(tx),
            },
            rx,
        )
    }

    pub fn emit(&self, event: MediaEvent) -> bool {
        match &self.target {
            SinkTarget::Session(tx) => tx.send(SessionEvent::Media(event)).is_ok(),
            SinkTarget::Detached(tx) => tx.send(event).is_ok(),
        }
    }
}

/// Ordered, reliable duplex channel to the relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Connects to `endpoint`. Inbound frames and the eventual close go to
    /// `sink`. A transport may be reopened after [`close`](Self::close).
    async fn open(&self, endpoint: &str, sink: SignalingSink) -> Result<(), TransportError>;

    /// Queues one frame. Fails with [`TransportError::NotOpen`] when not connected.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Idempotent; never fails.
    async fn close(&self);
}

/// The peer connection as seen by the orchestrator.
///
/// `create_offer` and `create_answer` also install the result as the local
/// description.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Called once, before any other method.
    fn attach(&self, sink: MediaEventSink);

    async fn create_offer(&self) -> Result<Description, NegotiationError>;

    async fn create_answer(&self) -> Result<Description, NegotiationError>;

    async fn set_remote_description(&self, description: Description)
    -> Result<(), NegotiationError>;

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError>;

    async fn apply_ice_config(&self, _config: &IceConfig) -> Result<(), NegotiationError> {
        Ok(())
    }

    /// Sends one frame on the relay data channel `label`.
    async fn send_signaling(&self, label: &str, _frame: Bytes) -> Result<(), NegotiationError> {
        Err(NegotiationError::DataChannel(format!(
            "no relay data channel {label}"
        )))
    }

    async fn stats(&self) -> Option<Value> {
        None
    }

    /// Idempotent; never fails.
    async fn close(&self);
}
