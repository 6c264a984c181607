//! Scripted in-memory transports for exercising sessions without a relay.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{NegotiationError, TransportError};
use crate::transport::{
    Candidate, Description, IceConfig, MediaEvent, MediaEventSink, MediaTransport,
    SignalingSink, SignalingTransport,
};

async fn wait_until<T>(changed: &Notify, mut check: impl FnMut() -> Option<T>) -> T {
    loop {
        let notified = changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if let Some(value) = check() {
            return value;
        }
        notified.await;
    }
}

#[derive(Default)]
struct SignalingState {
    sink: Option<SignalingSink>,
    open: bool,
    opened: Vec<String>,
    sent: Vec<Value>,
    close_calls: usize,
    open_failure: Option<TransportError>,
    unreachable: HashSet<String>,
    gate: Option<Arc<Notify>>,
}

/// Signaling transport that records what the session sends and lets a test
/// play the relay's side.
#[derive(Default)]
pub struct MockSignaling {
    state: Mutex<SignalingState>,
    changed: Notify,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `open` call fails with `error`.
    pub fn failing_open(error: TransportError) -> Arc<Self> {
        let mock = Self::default();
        mock.state.lock().open_failure = Some(error);
        Arc::new(mock)
    }

    /// `open` records its endpoint, then waits for [`release_open`](Self::release_open)
    /// before connecting.
    pub fn gated() -> Arc<Self> {
        let mock = Self::default();
        mock.state.lock().gate = Some(Arc::new(Notify::new()));
        Arc::new(mock)
    }

    pub fn release_open(&self) {
        if let Some(gate) = self.state.lock().gate.as_ref() {
            gate.notify_one();
        }
    }

    /// Waits until `open` has been called `attempts` times, connected or not.
    pub async fn wait_for_attempts(&self, attempts: usize) {
        wait_until(&self.changed, || {
            (self.state.lock().opened.len() >= attempts).then_some(())
        })
        .await
    }

    /// `open` fails for `endpoint` only.
    pub fn set_unreachable(&self, endpoint: &str) {
        self.state.lock().unreachable.insert(endpoint.to_string());
    }

    /// Delivers `message` as if the relay had sent it.
    pub fn inject(&self, message: Value) -> bool {
        self.inject_raw(message.to_string())
    }

    pub fn inject_raw(&self, frame: impl Into<Bytes>) -> bool {
        let sink = self.state.lock().sink.clone();
        match sink {
            Some(sink) => sink.message(frame),
            None => false,
        }
    }

    /// Simulates the relay dropping the connection.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let sink = {
            let mut state = self.state.lock();
            state.open = false;
            state.sink.take()
        };
        self.changed.notify_waiters();
        match sink {
            Some(sink) => sink.closed(Some(reason.to_string())),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn opened_endpoints(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    pub fn sent(&self) -> Vec<Value> {
        self.state.lock().sent.clone()
    }

    pub fn sent_kinds(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|message| message["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub async fn wait_for_open(&self, attempts: usize) {
        wait_until(&self.changed, || {
            let state = self.state.lock();
            (state.open && state.opened.len() >= attempts).then_some(())
        })
        .await
    }

    /// Waits for the `n`th (zero-based) sent message of type `kind`.
    pub async fn wait_for_sent_nth(&self, kind: &str, n: usize) -> Value {
        wait_until(&self.changed, || {
            self.state
                .lock()
                .sent
                .iter()
                .filter(|message| message["type"] == kind)
                .nth(n)
                .cloned()
        })
        .await
    }

    pub async fn wait_for_sent(&self, kind: &str) -> Value {
        self.wait_for_sent_nth(kind, 0).await
    }
}

#[async_trait]
impl SignalingTransport for MockSignaling {
    async fn open(&self, endpoint: &str, sink: SignalingSink) -> Result<(), TransportError> {
        let gate = {
            let mut state = self.state.lock();
            state.opened.push(endpoint.to_string());
            state.gate.clone()
        };
        self.changed.notify_waiters();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let result = {
            let mut state = self.state.lock();
            let failure = if state.unreachable.contains(endpoint) {
                Some(TransportError::Setup(format!("{endpoint} unreachable")))
            } else {
                state.open_failure.clone()
            };
            match failure {
                Some(error) => Err(error),
                None => {
                    state.sink = Some(sink);
                    state.open = true;
                    Ok(())
                }
            }
        };
        self.changed.notify_waiters();
        result
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            let message = serde_json::from_slice(&frame)
                .map_err(|err| TransportError::Send(err.to_string()))?;
            state.sent.push(message);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            state.close_calls += 1;
            state.open = false;
            state.sink = None;
        }
        self.changed.notify_waiters();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaCall {
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(Description),
    AddCandidate(Candidate),
    ApplyIceConfig(IceConfig),
    SendSignaling { label: String, message: Value },
    Stats,
    Close,
}

#[derive(Default)]
struct MediaState {
    sink: Option<MediaEventSink>,
    calls: Vec<MediaCall>,
    answers: usize,
    fail_create_offer: bool,
    fail_create_answer: bool,
    fail_remote_description: bool,
    fail_add_candidate: bool,
    stats: Option<Value>,
}

/// Media transport that logs every call and emits events on demand.
#[derive(Default)]
pub struct MockMedia {
    state: Mutex<MediaState>,
    changed: Notify,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create_offer(&self, fail: bool) {
        self.state.lock().fail_create_offer = fail;
    }

    pub fn fail_create_answer(&self, fail: bool) {
        self.state.lock().fail_create_answer = fail;
    }

    pub fn fail_remote_description(&self, fail: bool) {
        self.state.lock().fail_remote_description = fail;
    }

    pub fn fail_add_candidate(&self, fail: bool) {
        self.state.lock().fail_add_candidate = fail;
    }

    pub fn set_stats(&self, stats: Value) {
        self.state.lock().stats = Some(stats);
    }

    /// Delivers `message` as if the relay had sent it on data channel `label`.
    pub fn inject_signaling(&self, label: &str, message: Value) -> bool {
        self.emit(MediaEvent::SignalingMessage {
            label: label.to_string(),
            frame: Bytes::from(message.to_string()),
        })
    }

    /// Messages the session sent on relay data channels, as `(label, message)`.
    pub fn sent_signaling(&self) -> Vec<(String, Value)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MediaCall::SendSignaling { label, message } => {
                    Some((label.clone(), message.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Emits `event` into the attached session.
    pub fn emit(&self, event: MediaEvent) -> bool {
        let sink = self.state.lock().sink.clone();
        match sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.state.lock().calls.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, MediaCall::Close))
            .count()
    }

    pub async fn wait_for_call(&self, matches: impl Fn(&MediaCall) -> bool) -> MediaCall {
        wait_until(&self.changed, || {
            self.state.lock().calls.iter().find(|call| matches(call)).cloned()
        })
        .await
    }

    fn record(&self, call: MediaCall) {
        self.state.lock().calls.push(call);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl MediaTransport for MockMedia {
    fn attach(&self, sink: MediaEventSink) {
        self.state.lock().sink = Some(sink);
    }

    async fn create_offer(&self) -> Result<Description, NegotiationError> {
        self.record(MediaCall::CreateOffer);
        if self.state.lock().fail_create_offer {
            return Err(NegotiationError::CreateOffer("scripted failure".into()));
        }
        Ok(Description::offer("v=0\r\ns=mock-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<Description, NegotiationError> {
        self.record(MediaCall::CreateAnswer);
        let mut state = self.state.lock();
        if state.fail_create_answer {
            return Err(NegotiationError::CreateAnswer("scripted failure".into()));
        }
        state.answers += 1;
        Ok(Description::answer(format!(
            "v=0\r\ns=mock-answer-{}\r\n",
            state.answers
        )))
    }

    async fn set_remote_description(
        &self,
        description: Description,
    ) -> Result<(), NegotiationError> {
        self.record(MediaCall::SetRemoteDescription(description));
        if self.state.lock().fail_remote_description {
            return Err(NegotiationError::RemoteDescription("scripted failure".into()));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError> {
        self.record(MediaCall::AddCandidate(candidate));
        if self.state.lock().fail_add_candidate {
            return Err(NegotiationError::Candidate("scripted failure".into()));
        }
        Ok(())
    }

    async fn apply_ice_config(&self, config: &IceConfig) -> Result<(), NegotiationError> {
        self.record(MediaCall::ApplyIceConfig(config.clone()));
        Ok(())
    }

    async fn send_signaling(&self, label: &str, frame: Bytes) -> Result<(), NegotiationError> {
        let message = serde_json::from_slice(&frame)
            .map_err(|err| NegotiationError::DataChannel(err.to_string()))?;
        self.record(MediaCall::SendSignaling {
            label: label.to_string(),
            message,
        });
        Ok(())
    }

    async fn stats(&self) -> Option<Value> {
        self.record(MediaCall::Stats);
        self.state.lock().stats.clone()
    }

    async fn close(&self) {
        self.record(MediaCall::Close);
        self.state.lock().sink = None;
    }
}
