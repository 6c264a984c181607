use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::FailureReason;
use crate::session::SessionState;
use crate::transport::Track;

/// Non-fatal conditions reported while a session stays up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionWarning {
    #[error("media transport reported a disconnect")]
    MediaDisconnected,
    #[error("renegotiation abandoned: {0}")]
    RenegotiationFailed(String),
    #[error("remote candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("redirect to {0} ignored on a connected session")]
    RedirectIgnored(String),
}

/// Lifecycle callbacks for one session.
///
/// Callbacks run on the session's event loop, one at a time and in order.
/// They must return promptly. The last callback of every session is either
/// `on_state_changed(&SessionState::Closed)` or `on_error`.
pub trait SessionObserver: Send + Sync {
    fn on_state_changed(&self, _state: &SessionState) {}

    fn on_notify(&self, _payload: &Value) {}

    fn on_push(&self, _payload: &Value) {}

    fn on_track_added(&self, _track: &Track) {}

    fn on_track_removed(&self, _track: &Track) {}

    fn on_warning(&self, _warning: &SessionWarning) {}

    fn on_error(&self, _reason: &FailureReason) {}
}

/// Observer callbacks reified as values, for channel-based consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    StateChanged(SessionState),
    Notify(Value),
    Push(Value),
    TrackAdded(Track),
    TrackRemoved(Track),
    Warning(SessionWarning),
    Error(FailureReason),
}

impl ObserverEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ObserverEvent::StateChanged(SessionState::Closed) | ObserverEvent::Error(_)
        )
    }
}

impl SessionObserver for mpsc::UnboundedSender<ObserverEvent> {
    fn on_state_changed(&self, state: &SessionState) {
        let _ = self.send(ObserverEvent::StateChanged(state.clone()));
    }

    fn on_notify(&self, payload: &Value) {
        let _ = self.send(ObserverEvent::Notify(payload.clone()));
    }

    fn on_push(&self, payload: &Value) {
        let _ = self.send(ObserverEvent::Push(payload.clone()));
    }

    fn on_track_added(&self, track: &Track) {
        let _ = self.send(ObserverEvent::TrackAdded(track.clone()));
    }

    fn on_track_removed(&self, track: &Track) {
        let _ = self.send(ObserverEvent::TrackRemoved(track.clone()));
    }

    fn on_warning(&self, warning: &SessionWarning) {
        let _ = self.send(ObserverEvent::Warning(warning.clone()));
    }

    fn on_error(&self, reason: &FailureReason) {
        let _ = self.send(ObserverEvent::Error(reason.clone()));
    }
}

/// Convenience: a channel observer and the receiving end of its events.
pub fn channel_observer() -> (
    mpsc::UnboundedSender<ObserverEvent>,
    mpsc::UnboundedReceiver<ObserverEvent>,
) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_observer_forwards_callbacks_in_order() {
        let (observer, mut events) = channel_observer();
        observer.on_state_changed(&SessionState::Connected);
        observer.on_notify(&serde_json::json!({"event_type": "connection.created"}));
        observer.on_error(&FailureReason::Timeout);

        assert_eq!(
            events.try_recv().unwrap(),
            ObserverEvent::StateChanged(SessionState::Connected)
        );
        assert!(matches!(events.try_recv().unwrap(), ObserverEvent::Notify(_)));
        let last = events.try_recv().unwrap();
        assert!(last.is_terminal());
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (observer, events) = channel_observer();
        drop(events);
        observer.on_warning(&SessionWarning::MediaDisconnected);
    }
}
