use std::io::Write;

use parking_lot::Mutex;
use relay_session::{FailureReason, SessionObserver, SessionState, SessionWarning, Track};
use serde_json::Value;

/// Writes one line per observer callback.
pub struct LinePrinter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> LinePrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn line(&self, text: String) {
        let mut out = self.out.lock();
        if let Err(err) = writeln!(out, "{text}").and_then(|_| out.flush()) {
            tracing::debug!(error = %err, "observer output failed");
        }
    }
}

impl<W: Write + Send> SessionObserver for LinePrinter<W> {
    fn on_state_changed(&self, state: &SessionState) {
        self.line(format!("state    {state}"));
    }

    fn on_notify(&self, payload: &Value) {
        self.line(format!("notify   {payload}"));
    }

    fn on_push(&self, payload: &Value) {
        self.line(format!("push     {payload}"));
    }

    fn on_track_added(&self, track: &Track) {
        self.line(format!(
            "track+   {:?} {} (stream {})",
            track.kind, track.id, track.stream_id
        ));
    }

    fn on_track_removed(&self, track: &Track) {
        self.line(format!(
            "track-   {:?} {} (stream {})",
            track.kind, track.id, track.stream_id
        ));
    }

    fn on_warning(&self, warning: &SessionWarning) {
        self.line(format!("warning  {warning}"));
    }

    fn on_error(&self, reason: &FailureReason) {
        self.line(format!("error    {reason}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_session::TrackKind;
    use serde_json::json;

    #[test]
    fn each_callback_prints_one_line() {
        let printer = LinePrinter::new(Vec::new());
        printer.on_state_changed(&SessionState::Connecting);
        printer.on_notify(&json!({"event_type": "connection.created"}));
        printer.on_track_added(&Track {
            id: "video-1".into(),
            stream_id: "conn-peer".into(),
            kind: TrackKind::Video,
        });
        printer.on_error(&FailureReason::Timeout);

        let out = String::from_utf8(printer.into_inner()).expect("utf8");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("state"));
        assert!(lines[1].contains("connection.created"));
        assert_eq!(lines[2], "track+   Video video-1 (stream conn-peer)");
        assert!(lines[3].starts_with("error"));
    }
}
