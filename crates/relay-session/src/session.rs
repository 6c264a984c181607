use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec::{
    self, ConnectMessage, Inbound, OfferMessage, Outbound, PingMessage, SwitchedMessage,
};
use crate::config::Configuration;
use crate::error::{FailureReason, NegotiationError, SessionError, TransportError};
use crate::identity::SessionIdentity;
use crate::observer::{SessionObserver, SessionWarning};
use crate::transport::{
    Candidate, Description, MediaEvent, MediaEventSink, MediaTransport, SIGNALING_LABEL,
    STATS_LABEL, SdpKind, SignalingEvent, SignalingSink, SignalingTransport, Track,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_REASON: &str = "NO-ERROR";
/// How long the websocket stays up after the relay switched signaling to
/// data channels with `ignore_disconnect_websocket`.
pub const SIGNALING_RETIRE_DELAY: Duration = Duration::from_secs(10);

static RUNTIME: Lazy<Runtime> = Lazy::new(|| Runtime::new().expect("tokio runtime"));

fn spawn_on_global<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => handle.spawn(future),
        Err(_) => RUNTIME.spawn(future),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Which side produces the first session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationRole {
    /// Wait for the relay's `offer` and answer it.
    #[default]
    Answerer,
    /// Put a local offer in `connect` and wait for the relay's `answer`.
    Offerer,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub configuration: Arc<Configuration>,
    pub identity: SessionIdentity,
    /// Upper bound on the time spent in `Connecting`.
    pub timeout: Duration,
    pub negotiation: NegotiationRole,
}

impl SessionParams {
    pub fn new(configuration: Arc<Configuration>, identity: SessionIdentity) -> Self {
        Self {
            configuration,
            identity,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            negotiation: NegotiationRole::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_negotiation(mut self, negotiation: NegotiationRole) -> Self {
        self.negotiation = negotiation;
        self
    }

    fn validate(&self) -> Result<(), SessionError> {
        self.identity.validate()?;
        if self.timeout.is_zero() {
            return Err(SessionError::ConfigurationInvalid(
                "timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Transports {
    pub signaling: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaTransport>,
}

impl Transports {
    pub fn new(signaling: Arc<dyn SignalingTransport>, media: Arc<dyn MediaTransport>) -> Self {
        Self { signaling, media }
    }
}

pub(crate) enum SessionEvent {
    Disconnect,
    SignalingOpened {
        generation: u64,
        result: Result<(), TransportError>,
    },
    Signaling {
        generation: u64,
        event: SignalingEvent,
    },
    Media(MediaEvent),
    TimerElapsed,
    RetireSignaling {
        generation: u64,
    },
}

/// Facts about a session learned while connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Assigned by the relay in its offer.
    pub connection_id: Option<String>,
    /// First endpoint that accepted the signaling connection.
    pub contact_endpoint: Option<String>,
    /// Endpoint the handshake completed on; differs from the contact
    /// endpoint after a redirect.
    pub connected_endpoint: Option<String>,
}

/// Caller-side handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<SessionState>,
    info: Arc<Mutex<SessionInfo>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Connection id assigned by the relay in its offer, once known.
    pub fn connection_id(&self) -> Option<String> {
        self.info.lock().connection_id.clone()
    }

    pub fn contact_endpoint(&self) -> Option<String> {
        self.info.lock().contact_endpoint.clone()
    }

    pub fn connected_endpoint(&self) -> Option<String> {
        self.info.lock().connected_endpoint.clone()
    }

    pub fn info(&self) -> SessionInfo {
        self.info.lock().clone()
    }

    /// Requests a graceful close. Calling it again, or after the session
    /// ended, does nothing.
    pub fn disconnect(&self) {
        if self.events.send(SessionEvent::Disconnect).is_err() {
            trace!(target = "session", session_id = %self.id, "disconnect after session ended");
        }
    }

    /// Resolves with the terminal state once the session has delivered its
    /// last observer callback.
    pub async fn closed(&self) -> SessionState {
        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}
        let terminal = state.borrow().clone();
        terminal
    }
}

/// Starts a session and returns immediately in `Connecting`.
///
/// Invalid parameters are reported here, before either transport is used.
/// Everything after that is reported through `observer`.
pub fn start(
    params: SessionParams,
    transports: Transports,
    observer: Arc<dyn SessionObserver>,
) -> Result<SessionHandle, SessionError> {
    params.validate()?;

    let id = Uuid::new_v4();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
    let info = Arc::new(Mutex::new(SessionInfo::default()));
    let fallback_endpoints: VecDeque<String> =
        params.identity.fallback_endpoints.iter().cloned().collect();

    info!(
        target = "session",
        session_id = %id,
        endpoint = %params.identity.endpoint,
        channel_id = %params.identity.channel_id,
        timeout_ms = params.timeout.as_millis() as u64,
        "starting relay session"
    );

    let session = SessionLoop {
        id,
        signaling: transports.signaling,
        media: transports.media,
        observer,
        events: events_tx.clone(),
        state: SessionState::Idle,
        state_tx,
        generation: 0,
        signaling_open: false,
        connect_sent: false,
        opening: None,
        timer: None,
        pending: Some(PendingNegotiation::default()),
        info: info.clone(),
        endpoint: params.identity.endpoint.clone(),
        fallback_endpoints,
        switched: None,
        retire_signaling: None,
        params,
    };
    spawn_on_global(session.run(events_rx));

    Ok(SessionHandle {
        id,
        events: events_tx,
        state: state_rx,
        info,
    })
}

enum Deferred {
    Notify(Value),
    Push(Value),
    TrackAdded(Track),
    TrackRemoved(Track),
}

#[derive(Default)]
struct PendingNegotiation {
    local: Option<Description>,
    remote_applied: bool,
    remote_candidates: Vec<Candidate>,
    local_candidates: Vec<Candidate>,
    deferred: Vec<Deferred>,
}

#[derive(Clone, Copy)]
enum Renegotiation {
    Update,
    ReOffer,
}

struct SessionLoop {
    id: Uuid,
    params: SessionParams,
    signaling: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaTransport>,
    observer: Arc<dyn SessionObserver>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    generation: u64,
    signaling_open: bool,
    connect_sent: bool,
    opening: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    pending: Option<PendingNegotiation>,
    info: Arc<Mutex<SessionInfo>>,
    /// Endpoint of the current signaling attempt.
    endpoint: String,
    /// Untried endpoints; emptied by a redirect.
    fallback_endpoints: VecDeque<String>,
    switched: Option<SwitchedMessage>,
    retire_signaling: Option<JoinHandle<()>>,
}

impl SessionLoop {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        self.begin().await;
        while !self.state.is_terminal() {
            let Some(event) = events.recv().await else {
                break;
            };
            self.handle(event).await;
        }
        debug!(
            target = "session",
            session_id = %self.id,
            state = %self.state,
            "session loop finished"
        );
    }

    async fn begin(&mut self) {
        self.media
            .attach(MediaEventSink::session(self.events.clone()));
        self.arm_timer();
        self.set_state(SessionState::Connecting);

        if self.params.negotiation == NegotiationRole::Offerer {
            match self.media.create_offer().await {
                Ok(offer) => {
                    if let Some(pending) = self.pending.as_mut() {
                        pending.local = Some(offer);
                    }
                }
                Err(err) => {
                    self.fail(err.into()).await;
                    return;
                }
            }
        }

        let endpoint = self.endpoint.clone();
        self.open_signaling(endpoint);
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Disconnect => self.teardown(None).await,
            SessionEvent::TimerElapsed => {
                if self.state == SessionState::Connecting {
                    warn!(
                        target = "session",
                        session_id = %self.id,
                        timeout_ms = self.params.timeout.as_millis() as u64,
                        "session did not connect in time"
                    );
                    self.fail(FailureReason::Timeout).await;
                }
            }
            SessionEvent::SignalingOpened { generation, result } => {
                self.on_signaling_opened(generation, result).await
            }
            SessionEvent::Signaling { generation, event } => {
                if generation != self.generation {
                    trace!(
                        target = "session",
                        session_id = %self.id,
                        generation,
                        current = self.generation,
                        "ignoring event from abandoned signaling connection"
                    );
                    return;
                }
                match event {
                    SignalingEvent::Message(frame) => self.on_frame(frame).await,
                    SignalingEvent::Closed(reason) => self.on_signaling_closed(reason).await,
                }
            }
            SessionEvent::Media(event) => self.on_media_event(event).await,
            SessionEvent::RetireSignaling { generation } => {
                if generation == self.generation && self.signaling_open {
                    debug!(target = "session", session_id = %self.id, "closing websocket after switch to data channels");
                    self.signaling_open = false;
                    self.signaling.close().await;
                }
            }
        }
    }

    fn arm_timer(&mut self) {
        let events = self.events.clone();
        let timeout = self.params.timeout;
        self.timer = Some(spawn_on_global(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SessionEvent::TimerElapsed);
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn open_signaling(&mut self, endpoint: String) {
        self.endpoint = endpoint.clone();
        self.generation += 1;
        let generation = self.generation;
        let sink = SignalingSink::session(generation, self.events.clone());
        let signaling = self.signaling.clone();
        let events = self.events.clone();
        debug!(
            target = "session",
            session_id = %self.id,
            endpoint = %endpoint,
            generation,
            "opening signaling"
        );
        self.opening = Some(spawn_on_global(async move {
            let result = signaling.open(&endpoint, sink).await;
            let _ = events.send(SessionEvent::SignalingOpened { generation, result });
        }));
    }

    async fn on_signaling_opened(&mut self, generation: u64, result: Result<(), TransportError>) {
        if generation != self.generation || self.state != SessionState::Connecting {
            return;
        }
        self.opening = None;
        if let Err(err) = result {
            if let Some(next) = self.fallback_endpoints.pop_front() {
                warn!(
                    target = "session",
                    session_id = %self.id,
                    endpoint = %self.endpoint,
                    next = %next,
                    error = %err,
                    "signaling endpoint unreachable; trying the next one"
                );
                self.open_signaling(next);
                return;
            }
            self.fail(err.into()).await;
            return;
        }
        self.signaling_open = true;
        self.info
            .lock()
            .contact_endpoint
            .get_or_insert_with(|| self.endpoint.clone());

        let (offer_sdp, local_candidates) = match self.pending.as_ref() {
            Some(pending) => (
                pending
                    .local
                    .as_ref()
                    .filter(|description| description.kind == SdpKind::Offer)
                    .map(|description| description.sdp.clone()),
                pending.local_candidates.clone(),
            ),
            None => (None, Vec::new()),
        };
        let connect = Outbound::Connect(ConnectMessage::new(
            &self.params.configuration,
            &self.params.identity,
            offer_sdp,
        ));
        if let Err(reason) = self.send(&connect) {
            self.fail(reason).await;
            return;
        }
        self.connect_sent = true;

        for candidate in local_candidates {
            if let Err(reason) = self.send(&Outbound::Candidate(candidate)) {
                warn!(target = "session", session_id = %self.id, error = %reason, "failed to send local candidate");
            }
        }
    }

    async fn on_signaling_closed(&mut self, reason: Option<String>) {
        self.signaling_open = false;
        if self
            .switched
            .as_ref()
            .is_some_and(|switched| switched.ignore_disconnect_websocket)
        {
            debug!(target = "session", session_id = %self.id, reason = ?reason, "websocket closed after switch to data channels");
            return;
        }
        let detail = reason.unwrap_or_else(|| "connection closed".to_string());
        warn!(
            target = "session",
            session_id = %self.id,
            reason = %detail,
            "signaling closed unexpectedly"
        );
        self.fail(FailureReason::TransportClosed(detail)).await;
    }

    async fn on_frame(&mut self, frame: Bytes) {
        if let Some(message) = self.decode(&frame).await {
            self.on_message(message).await;
        }
    }

    /// Frames from the relay's data channels, after or alongside the websocket.
    async fn on_relay_channel_message(&mut self, label: String, frame: Bytes) {
        trace!(target = "session", session_id = %self.id, label = %label, "relay data channel message");
        if let Some(message) = self.decode(&frame).await {
            self.on_message(message).await;
        }
    }

    async fn decode(&mut self, frame: &[u8]) -> Option<Inbound> {
        match codec::decode(frame) {
            Err(err) => {
                if self.state == SessionState::Connecting {
                    warn!(target = "session", session_id = %self.id, error = %err, "malformed handshake message");
                    self.fail(FailureReason::ProtocolError(err.to_string()))
                        .await;
                } else {
                    warn!(target = "session", session_id = %self.id, error = %err, "dropping malformed signaling message");
                }
                None
            }
            Ok(message) => {
                trace!(
                    target = "session",
                    session_id = %self.id,
                    kind = message.kind(),
                    "signaling message received"
                );
                Some(message)
            }
        }
    }

    async fn on_message(&mut self, message: Inbound) {
        match message {
            Inbound::Offer(offer) => self.on_offer(offer).await,
            Inbound::Answer(answer) => self.on_answer(answer.sdp).await,
            Inbound::Candidate(candidate) => self.on_remote_candidate(candidate).await,
            Inbound::Update(message) => {
                self.on_renegotiation(message.sdp, Renegotiation::Update)
                    .await
            }
            Inbound::ReOffer(message) => {
                self.on_renegotiation(message.sdp, Renegotiation::ReOffer)
                    .await
            }
            Inbound::Notify(payload) => self.deliver(Deferred::Notify(payload)),
            Inbound::Push(payload) => self.deliver(Deferred::Push(payload)),
            Inbound::Ping(ping) => self.on_ping(ping).await,
            Inbound::Redirect(redirect) => self.on_redirect(redirect.location).await,
            Inbound::Reject(reject) => {
                let reason = reject.reason.unwrap_or_else(|| "rejected".to_string());
                warn!(target = "session", session_id = %self.id, reason = %reason, "relay rejected session");
                self.fail(FailureReason::Rejected(reason)).await;
            }
            Inbound::Switched(switched) => self.on_switched(switched),
            Inbound::ReqStats => self.on_stats_request().await,
            Inbound::Unknown(kind) => {
                debug!(target = "session", session_id = %self.id, kind = %kind, "ignoring unknown signaling message");
            }
        }
    }

    async fn on_offer(&mut self, offer: OfferMessage) {
        if self.state != SessionState::Connecting {
            warn!(target = "session", session_id = %self.id, "ignoring offer outside of the handshake");
            return;
        }
        if self.params.negotiation == NegotiationRole::Offerer {
            self.fail(FailureReason::ProtocolError(
                "relay sent an offer to an offering client".into(),
            ))
            .await;
            return;
        }
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.remote_applied)
        {
            warn!(target = "session", session_id = %self.id, "ignoring duplicate offer");
            return;
        }

        if let Some(connection_id) = offer.connection_id.clone() {
            self.info.lock().connection_id = Some(connection_id);
        }
        debug!(
            target = "session",
            session_id = %self.id,
            connection_id = ?offer.connection_id,
            client_id = ?offer.client_id,
            "applying relay offer"
        );

        if let Some(config) = &offer.config {
            if let Err(err) = self.media.apply_ice_config(config).await {
                self.fail(err.into()).await;
                return;
            }
        }
        if let Err(err) = self
            .media
            .set_remote_description(Description::offer(offer.sdp))
            .await
        {
            self.fail(err.into()).await;
            return;
        }
        self.mark_remote_applied().await;

        let answer = match self.media.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                self.fail(err.into()).await;
                return;
            }
        };
        let reply = Outbound::Answer {
            sdp: answer.sdp.clone(),
        };
        if let Err(reason) = self.send(&reply) {
            self.fail(reason).await;
            return;
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.local = Some(answer);
        }
    }

    async fn on_answer(&mut self, sdp: String) {
        if self.state != SessionState::Connecting {
            debug!(target = "session", session_id = %self.id, "ignoring answer outside of the handshake");
            return;
        }
        let awaiting_answer = self.pending.as_ref().is_some_and(|pending| {
            !pending.remote_applied
                && pending
                    .local
                    .as_ref()
                    .is_some_and(|local| local.kind == SdpKind::Offer)
        });
        if !awaiting_answer {
            self.fail(FailureReason::ProtocolError(
                "answer received without an outstanding offer".into(),
            ))
            .await;
            return;
        }
        if let Err(err) = self
            .media
            .set_remote_description(Description::answer(sdp))
            .await
        {
            self.fail(err.into()).await;
            return;
        }
        self.mark_remote_applied().await;
    }

    async fn mark_remote_applied(&mut self) {
        self.info.lock().connected_endpoint = Some(self.endpoint.clone());
        let buffered = match self.pending.as_mut() {
            Some(pending) => {
                pending.remote_applied = true;
                std::mem::take(&mut pending.remote_candidates)
            }
            None => Vec::new(),
        };
        if !buffered.is_empty() {
            debug!(
                target = "session",
                session_id = %self.id,
                count = buffered.len(),
                "flushing buffered remote candidates"
            );
        }
        for candidate in buffered {
            self.apply_remote_candidate(candidate).await;
        }
    }

    async fn on_remote_candidate(&mut self, candidate: Candidate) {
        match self.state {
            SessionState::Connecting => {
                if let Some(pending) = self.pending.as_mut() {
                    if !pending.remote_applied {
                        trace!(target = "session", session_id = %self.id, "buffering remote candidate");
                        pending.remote_candidates.push(candidate);
                        return;
                    }
                }
                self.apply_remote_candidate(candidate).await;
            }
            SessionState::Connected => self.apply_remote_candidate(candidate).await,
            _ => {}
        }
    }

    async fn apply_remote_candidate(&mut self, candidate: Candidate) {
        if let Err(err) = self.media.add_candidate(candidate).await {
            warn!(target = "session", session_id = %self.id, error = %err, "remote candidate rejected");
            self.warn_observer(SessionWarning::CandidateRejected(err.to_string()));
        }
    }

    async fn on_renegotiation(&mut self, sdp: String, kind: Renegotiation) {
        if self.state != SessionState::Connected {
            debug!(target = "session", session_id = %self.id, "ignoring renegotiation before connected");
            return;
        }
        match self.renegotiate(sdp).await {
            Ok(answer) => {
                let reply = match kind {
                    Renegotiation::Update => Outbound::Update { sdp: answer.sdp },
                    Renegotiation::ReOffer => Outbound::ReAnswer { sdp: answer.sdp },
                };
                if let Err(reason) = self.reply(&reply).await {
                    warn!(target = "session", session_id = %self.id, error = %reason, "failed to send renegotiation answer");
                }
            }
            Err(err) => {
                warn!(target = "session", session_id = %self.id, error = %err, "renegotiation abandoned");
                self.warn_observer(SessionWarning::RenegotiationFailed(err.to_string()));
            }
        }
    }

    async fn renegotiate(&self, sdp: String) -> Result<Description, NegotiationError> {
        self.media
            .set_remote_description(Description::offer(sdp))
            .await?;
        self.media.create_answer().await
    }

    async fn on_ping(&mut self, ping: PingMessage) {
        let stats = if ping.stats {
            self.media.stats().await
        } else {
            None
        };
        if let Err(reason) = self.send(&Outbound::Pong { stats }) {
            warn!(target = "session", session_id = %self.id, error = %reason, "failed to answer ping");
        }
    }

    fn on_switched(&mut self, switched: SwitchedMessage) {
        info!(
            target = "session",
            session_id = %self.id,
            ignore_disconnect_websocket = switched.ignore_disconnect_websocket,
            "signaling switched to data channels"
        );
        if switched.ignore_disconnect_websocket && self.retire_signaling.is_none() {
            let events = self.events.clone();
            let generation = self.generation;
            self.retire_signaling = Some(spawn_on_global(async move {
                tokio::time::sleep(SIGNALING_RETIRE_DELAY).await;
                let _ = events.send(SessionEvent::RetireSignaling { generation });
            }));
        }
        self.switched = Some(switched);
    }

    async fn on_stats_request(&mut self) {
        let reports = self.media.stats().await.unwrap_or(Value::Array(Vec::new()));
        let result = match codec::encode(&Outbound::Stats { reports }) {
            Ok(frame) => self
                .media
                .send_signaling(STATS_LABEL, frame)
                .await
                .map_err(FailureReason::from),
            Err(err) => Err(FailureReason::ProtocolError(err.to_string())),
        };
        if let Err(reason) = result {
            warn!(target = "session", session_id = %self.id, error = %reason, "failed to answer stats request");
        }
    }

    async fn on_redirect(&mut self, location: String) {
        if self.state != SessionState::Connecting {
            warn!(target = "session", session_id = %self.id, location = %location, "ignoring redirect on a live session");
            self.warn_observer(SessionWarning::RedirectIgnored(location));
            return;
        }
        info!(target = "session", session_id = %self.id, location = %location, "relay redirected session");
        self.fallback_endpoints.clear();
        self.signaling_open = false;
        self.connect_sent = false;
        self.signaling.close().await;
        self.open_signaling(location);
    }

    async fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Connected => self.on_media_connected().await,
            MediaEvent::Disconnected => {
                warn!(target = "session", session_id = %self.id, "media transport disconnected");
                self.warn_observer(SessionWarning::MediaDisconnected);
            }
            MediaEvent::TrackAdded(track) => {
                if !self.is_own_stream(&track) {
                    self.deliver(Deferred::TrackAdded(track));
                }
            }
            MediaEvent::TrackRemoved(track) => {
                if !self.is_own_stream(&track) {
                    self.deliver(Deferred::TrackRemoved(track));
                }
            }
            MediaEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            MediaEvent::SignalingMessage { label, frame } => {
                self.on_relay_channel_message(label, frame).await
            }
            MediaEvent::Error(detail) => {
                warn!(target = "session", session_id = %self.id, error = %detail, "media transport failed");
                self.fail(FailureReason::MediaError(detail)).await;
            }
        }
    }

    async fn on_media_connected(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }
        self.cancel_timer();
        let pending = self.pending.take().unwrap_or_default();
        if pending.remote_applied {
            for candidate in pending.remote_candidates {
                self.apply_remote_candidate(candidate).await;
            }
        } else if !pending.remote_candidates.is_empty() {
            warn!(
                target = "session",
                session_id = %self.id,
                count = pending.remote_candidates.len(),
                "dropping candidates that never had a remote description"
            );
        }

        info!(
            target = "session",
            session_id = %self.id,
            connection_id = ?self.info.lock().connection_id.as_deref(),
            endpoint = %self.endpoint,
            "session connected"
        );
        self.set_state(SessionState::Connected);
        for item in pending.deferred {
            self.dispatch(item);
        }
    }

    fn on_local_candidate(&mut self, candidate: Candidate) {
        if self.connect_sent && self.signaling_open {
            if let Err(reason) = self.send(&Outbound::Candidate(candidate.clone())) {
                warn!(target = "session", session_id = %self.id, error = %reason, "failed to send local candidate");
            }
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.local_candidates.push(candidate);
        }
    }

    fn is_own_stream(&self, track: &Track) -> bool {
        self.info
            .lock()
            .connection_id
            .as_deref()
            .is_some_and(|connection_id| connection_id == track.stream_id)
    }

    fn deliver(&mut self, item: Deferred) {
        match self.state {
            SessionState::Connected => self.dispatch(item),
            SessionState::Connecting => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.deferred.push(item);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&self, item: Deferred) {
        match item {
            Deferred::Notify(payload) => self.observer.on_notify(&payload),
            Deferred::Push(payload) => self.observer.on_push(&payload),
            Deferred::TrackAdded(track) => self.observer.on_track_added(&track),
            Deferred::TrackRemoved(track) => self.observer.on_track_removed(&track),
        }
    }

    fn warn_observer(&self, warning: SessionWarning) {
        if self.state == SessionState::Connected {
            self.observer.on_warning(&warning);
        }
    }

    fn send(&self, message: &Outbound) -> Result<(), FailureReason> {
        let frame = codec::encode(message)
            .map_err(|err| FailureReason::ProtocolError(err.to_string()))?;
        trace!(
            target = "session",
            session_id = %self.id,
            kind = message.kind(),
            bytes = frame.len(),
            "sending signaling message"
        );
        self.signaling.send(frame).map_err(FailureReason::from)
    }

    /// Sends a handshake reply on whichever channel currently carries signaling.
    async fn reply(&self, message: &Outbound) -> Result<(), FailureReason> {
        if self.switched.is_none() {
            return self.send(message);
        }
        let frame = codec::encode(message)
            .map_err(|err| FailureReason::ProtocolError(err.to_string()))?;
        trace!(
            target = "session",
            session_id = %self.id,
            kind = message.kind(),
            label = SIGNALING_LABEL,
            "sending signaling message on data channel"
        );
        self.media
            .send_signaling(SIGNALING_LABEL, frame)
            .await
            .map_err(FailureReason::from)
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(
            target = "session",
            session_id = %self.id,
            from = %self.state,
            to = %state,
            "session state changed"
        );
        self.state = state.clone();
        self.state_tx.send_replace(state.clone());
        match &state {
            SessionState::Failed(reason) => self.observer.on_error(reason),
            _ => self.observer.on_state_changed(&state),
        }
    }

    async fn fail(&mut self, reason: FailureReason) {
        self.teardown(Some(reason)).await;
    }

    /// The only way out of a session. `None` is a caller-requested close.
    async fn teardown(&mut self, failure: Option<FailureReason>) {
        if self.state.is_terminal() || self.state == SessionState::Closing {
            return;
        }
        self.cancel_timer();
        if let Some(retire) = self.retire_signaling.take() {
            retire.abort();
        }
        if let Some(opening) = self.opening.take() {
            opening.abort();
            // An open that already connected publishes its socket before the
            // task ends; wait so the close below sees it.
            let _ = opening.await;
        }
        self.pending = None;

        match &failure {
            None => {
                info!(target = "session", session_id = %self.id, "closing session");
                self.set_state(SessionState::Closing);
                if self.signaling_open || self.switched.is_some() {
                    let goodbye = Outbound::Disconnect {
                        reason: Some(DISCONNECT_REASON.to_string()),
                    };
                    if let Err(reason) = self.reply(&goodbye).await {
                        debug!(target = "session", session_id = %self.id, error = %reason, "disconnect message not delivered");
                    }
                }
            }
            Some(reason) => {
                warn!(
                    target = "session",
                    session_id = %self.id,
                    kind = reason.kind(),
                    reason = %reason,
                    "session failed"
                );
            }
        }

        self.signaling_open = false;
        self.signaling.close().await;
        self.media.close().await;

        let terminal = match failure {
            Some(reason) => SessionState::Failed(reason),
            None => SessionState::Closed,
        };
        self.set_state(terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed(FailureReason::Timeout).is_terminal());
        assert!(!SessionState::Closing.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
    }

    #[test]
    fn failed_state_displays_its_reason() {
        let state = SessionState::Failed(FailureReason::Rejected("quota".into()));
        assert_eq!(state.to_string(), "failed (rejected by relay: quota)");
    }

    #[test]
    fn params_default_to_ten_second_answerer() {
        let configuration = Arc::new(Configuration::builder().build().unwrap());
        let params = SessionParams::new(
            configuration,
            SessionIdentity::new("wss://relay.example/signaling", "room"),
        );
        assert_eq!(params.timeout, Duration::from_secs(10));
        assert_eq!(params.negotiation, NegotiationRole::Answerer);
        assert!(params.validate().is_ok());
        assert!(params.with_timeout(Duration::ZERO).validate().is_err());
    }
}
