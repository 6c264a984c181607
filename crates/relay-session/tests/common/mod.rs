#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_session::mock::{MockMedia, MockSignaling};
use relay_session::{
    Configuration, MediaEvent, ObserverEvent, SessionHandle, SessionIdentity, SessionParams,
    SessionState, Transports, channel_observer, start,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub const ENDPOINT: &str = "wss://relay.example/signaling";
pub const CONNECTION_ID: &str = "conn-self";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub struct Harness {
    pub handle: SessionHandle,
    pub signaling: Arc<MockSignaling>,
    pub media: Arc<MockMedia>,
    pub events: mpsc::UnboundedReceiver<ObserverEvent>,
}

pub fn params(timeout: Duration) -> SessionParams {
    let configuration = Arc::new(Configuration::builder().build().expect("valid configuration"));
    let identity = SessionIdentity::new(ENDPOINT, "sora-room")
        .with_client_id("device-1")
        .with_metadata(json!({"access_token": "token"}));
    SessionParams::new(configuration, identity).with_timeout(timeout)
}

pub fn launch(params: SessionParams) -> Harness {
    launch_with(params, MockSignaling::new(), MockMedia::new())
}

pub fn launch_with(
    params: SessionParams,
    signaling: Arc<MockSignaling>,
    media: Arc<MockMedia>,
) -> Harness {
    init_tracing();
    let (observer, events) = channel_observer();
    let handle = start(
        params,
        Transports::new(signaling.clone(), media.clone()),
        Arc::new(observer),
    )
    .expect("session starts");
    Harness {
        handle,
        signaling,
        media,
        events,
    }
}

pub fn offer() -> Value {
    json!({
        "type": "offer",
        "sdp": "v=0\r\ns=relay-offer\r\n",
        "client_id": "device-1",
        "connection_id": CONNECTION_ID,
    })
}

pub fn candidate(n: u32) -> Value {
    json!({
        "type": "candidate",
        "candidate": format!("candidate:{n} 1 udp 2122260223 192.0.2.{n} 5000{n} typ host"),
    })
}

impl Harness {
    pub async fn next_event(&mut self) -> ObserverEvent {
        self.events.recv().await.expect("observer channel open")
    }

    /// Drives the handshake up to `Connected`, consuming the observer events
    /// along the way.
    pub async fn connect(&mut self) {
        assert_eq!(
            self.next_event().await,
            ObserverEvent::StateChanged(SessionState::Connecting)
        );
        self.signaling.wait_for_sent("connect").await;
        self.signaling.inject(offer());
        self.signaling.wait_for_sent("answer").await;
        self.media.emit(MediaEvent::Connected);
        assert_eq!(
            self.next_event().await,
            ObserverEvent::StateChanged(SessionState::Connected)
        );
    }

    /// Collects observer events until the session's terminal one.
    pub async fn drain_to_terminal(&mut self) -> Vec<ObserverEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    }

    /// Asserts nothing else reaches the observer after the session ended.
    pub async fn assert_quiet(&mut self) {
        self.handle.closed().await;
        tokio::task::yield_now().await;
        assert!(
            self.events.try_recv().is_err(),
            "observer received events after the terminal one"
        );
    }
}
