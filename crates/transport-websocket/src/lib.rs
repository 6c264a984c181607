//! Websocket signaling transport for relay sessions.
//!
//! One websocket per `open`. A writer task owns the sink half, a reader task
//! feeds inbound frames to the session, and an optional heartbeat keeps idle
//! connections alive through proxies.

use std::env;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, Stream, StreamExt};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use relay_session::{SignalingSink, SignalingTransport, TransportError};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

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
pub struct WebSocketConfig {
    pub connect_timeout: Duration,
    /// `None` disables websocket pings.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
        }
    }
}

impl WebSocketConfig {
    /// Defaults, overridden by `RELAY_SIGNALING_CONNECT_TIMEOUT_MS` and
    /// `RELAY_SIGNALING_HEARTBEAT_MS` (0 disables the heartbeat).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_millis("RELAY_SIGNALING_CONNECT_TIMEOUT_MS") {
            if ms > 0 {
                config.connect_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(ms) = env_millis("RELAY_SIGNALING_HEARTBEAT_MS") {
            config.heartbeat_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        config
    }
}

fn env_millis(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

/// Accepts `ws`/`wss` endpoints as-is and maps `http`/`https` onto them.
pub fn websocket_url(endpoint: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(endpoint).map_err(|err| {
        TransportError::Setup(format!("invalid signaling url {endpoint}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    closing: Arc<AtomicBool>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct WebSocketSignaling {
    config: WebSocketConfig,
    connection: Mutex<Option<Connection>>,
}

impl Default for WebSocketSignaling {
    fn default() -> Self {
        Self::new(WebSocketConfig::default())
    }
}

impl WebSocketSignaling {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.lock().is_some()
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    async fn open(&self, endpoint: &str, sink: SignalingSink) -> Result<(), TransportError> {
        self.close().await;

        let url = websocket_url(endpoint)?;
        let (ws_stream, _) = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Setup(format!("websocket connect to {url} timed out")))?
        .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "signaling",
            url = %url,
            generation = sink.generation(),
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let closing = Arc::new(AtomicBool::new(false));

        let writer = spawn_on_global(async move {
            while let Some(message) = outbound_rx.recv().await {
                let last = matches!(message, Message::Close(_));
                if let Err(err) = ws_write.send(message).await {
                    tracing::debug!(target = "signaling", error = %err, "websocket write failed");
                    break;
                }
                if last {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_closing = Arc::clone(&closing);
        let reader = spawn_on_global(async move {
            let reason = read_frames(&mut ws_read, &sink).await;
            if reader_closing.load(Ordering::SeqCst) {
                tracing::trace!(target = "signaling", "reader stopped after local close");
                return;
            }
            tracing::debug!(target = "signaling", reason = %reason, "signaling websocket ended");
            sink.closed(Some(reason));
        });

        let heartbeat = self.config.heartbeat_interval.map(|interval| {
            let outbound = outbound.clone();
            spawn_on_global(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if outbound.send(Message::Ping(Vec::new())).is_err() {
                        break;
                    }
                }
            })
        });

        *self.connection.lock() = Some(Connection {
            outbound,
            closing,
            writer,
            reader,
            heartbeat,
        });
        Ok(())
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let guard = self.connection.lock();
        let connection = guard.as_ref().ok_or(TransportError::NotOpen)?;
        let message = match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(err) => Message::Binary(err.into_bytes()),
        };
        tracing::trace!(target = "signaling", event = "ws_out", len = frame.len());
        connection
            .outbound
            .send(message)
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };
        connection.closing.store(true, Ordering::SeqCst);
        connection.reader.abort();
        if let Some(heartbeat) = connection.heartbeat {
            heartbeat.abort();
        }
        let _ = connection.outbound.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })));
        drop(connection.outbound);
        if tokio::time::timeout(CLOSE_GRACE, connection.writer)
            .await
            .is_err()
        {
            tracing::debug!(target = "signaling", "websocket close handshake timed out");
        }
        tracing::debug!(target = "signaling", "signaling websocket closed");
    }
}

/// Pumps inbound frames into `sink` until the socket ends; returns why it ended.
async fn read_frames<S>(ws_read: &mut S, sink: &SignalingSink) -> String
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                tracing::trace!(target = "signaling", event = "ws_in", kind = "text", len = text.len());
                if !sink.message(text.into_bytes()) {
                    return "session dropped".to_string();
                }
            }
            Ok(Message::Binary(data)) => {
                tracing::trace!(target = "signaling", event = "ws_in", kind = "binary", len = data.len());
                if !sink.message(data) {
                    return "session dropped".to_string();
                }
            }
            Ok(Message::Close(frame)) => {
                return match frame {
                    Some(frame) if frame.code != CloseCode::Normal => format!(
                        "relay closed the connection with code {}: {}",
                        u16::from(frame.code),
                        frame.reason
                    ),
                    _ => "relay closed the connection".to_string(),
                };
            }
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                    }
                }
                return err.to_string();
            }
        }
    }
    "connection closed".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_endpoints_map_to_websocket_schemes() {
        assert_eq!(
            websocket_url("https://relay.example/signaling#x").unwrap().as_str(),
            "wss://relay.example/signaling"
        );
        assert_eq!(
            websocket_url("http://127.0.0.1:5000/signaling?room=a")
                .unwrap()
                .as_str(),
            "ws://127.0.0.1:5000/signaling?room=a"
        );
        assert_eq!(
            websocket_url("wss://relay.example/signaling").unwrap().as_str(),
            "wss://relay.example/signaling"
        );
    }

    #[test]
    fn other_schemes_are_rejected() {
        assert!(matches!(
            websocket_url("ftp://relay.example"),
            Err(TransportError::Setup(_))
        ));
        assert!(websocket_url("not a url").is_err());
    }

    #[test]
    fn connection_tasks_run_without_an_ambient_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        spawn_on_global(async move {
            let _ = tx.send(7u8);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(7));
    }

    #[test]
    fn send_requires_an_open_connection() {
        let signaling = WebSocketSignaling::default();
        assert_eq!(
            signaling.send(Bytes::from_static(b"{}")),
            Err(TransportError::NotOpen)
        );
        assert!(!signaling.is_open());
    }
}
