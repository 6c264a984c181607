use thiserror::Error;

/// Errors surfaced synchronously by [`crate::start`], before any transport is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),
}

/// Terminal reason carried by `SessionState::Failed` and delivered through
/// `SessionObserver::on_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("rejected by relay: {0}")]
    Rejected(String),
    #[error("timed out waiting for the session to connect")]
    Timeout,
    #[error("signaling transport closed: {0}")]
    TransportClosed(String),
    #[error("media transport error: {0}")]
    MediaError(String),
    #[error("negotiation failed: {0}")]
    NegotiationError(String),
}

impl FailureReason {
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::ProtocolError(_) => "protocol_error",
            FailureReason::Rejected(_) => "rejected",
            FailureReason::Timeout => "timeout",
            FailureReason::TransportClosed(_) => "transport_closed",
            FailureReason::MediaError(_) => "media_error",
            FailureReason::NegotiationError(_) => "negotiation_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("signaling transport is not open")]
    NotOpen,
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling send failed: {0}")]
    Send(String),
    #[error("signaling channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("failed to create offer: {0}")]
    CreateOffer(String),
    #[error("failed to create answer: {0}")]
    CreateAnswer(String),
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
    #[error("failed to add candidate: {0}")]
    Candidate(String),
    #[error("failed to apply ice configuration: {0}")]
    IceConfiguration(String),
    #[error("relay data channel unavailable: {0}")]
    DataChannel(String),
    #[error("media transport is closed")]
    Closed,
}

impl From<NegotiationError> for FailureReason {
    fn from(err: NegotiationError) -> Self {
        FailureReason::NegotiationError(err.to_string())
    }
}

impl From<TransportError> for FailureReason {
    fn from(err: TransportError) -> Self {
        FailureReason::TransportClosed(err.to_string())
    }
}
