//! Connection orchestrator for a client joining a media relay session.
//!
//! Responsibilities:
//! - validate what the caller wants to send and receive ([`Configuration`])
//! - drive the signaling handshake against the relay ([`codec`])
//! - negotiate the peer connection through an injected [`MediaTransport`]
//! - bound the handshake with a single timeout and tear both transports down
//!   through one path
//! - report exactly one ordered lifecycle stream to a [`SessionObserver`]
//!
//! The signaling socket and the media engine are collaborators supplied by
//! the caller; see the `transport-websocket` and `transport-webrtc` crates for
//! concrete ones and [`mock`] for scripted test doubles.

pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod mock;
pub mod observer;
pub mod session;
pub mod transport;

pub use config::{Configuration, ConfigurationBuilder, DataChannelRequest, Direction, Reliability};
pub use error::{FailureReason, NegotiationError, SessionError, TransportError};
pub use identity::SessionIdentity;
pub use observer::{ObserverEvent, SessionObserver, SessionWarning, channel_observer};
pub use session::{
    DEFAULT_CONNECT_TIMEOUT, NegotiationRole, SIGNALING_RETIRE_DELAY, SessionHandle, SessionInfo,
    SessionParams, SessionState, Transports, start,
};
pub use transport::{
    SIGNALING_LABEL, STATS_LABEL, Candidate, Description, IceConfig, IceServer, MediaEvent, MediaEventSink, MediaTransport,
    SdpKind, SignalingEvent, SignalingSink, SignalingTransport, Track, TrackKind,
};
