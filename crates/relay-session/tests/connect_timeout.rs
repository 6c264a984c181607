mod common;

use std::time::Duration;

use common::{launch, offer, params};
use relay_session::{
    FailureReason, MediaEvent, ObserverEvent, SIGNALING_RETIRE_DELAY, SessionState,
};
use serde_json::json;
use tokio::time::Instant;

#[test_timeout::tokio_timeout_test(10, paused)]
async fn silent_relay_times_out_after_the_deadline() {
    let started = Instant::now();
    let mut session = launch(params(Duration::from_secs(3)));

    let events = session.drain_to_terminal().await;
    assert_eq!(
        events,
        vec![
            ObserverEvent::StateChanged(SessionState::Connecting),
            ObserverEvent::Error(FailureReason::Timeout),
        ]
    );
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(
        session.handle.closed().await,
        SessionState::Failed(FailureReason::Timeout)
    );
    assert_eq!(session.signaling.close_calls(), 1);
    assert_eq!(session.media.close_calls(), 1);
    assert!(!session.signaling.is_open());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn no_timeout_before_the_deadline() {
    let mut session = launch(params(Duration::from_secs(3)));
    assert_eq!(
        session.next_event().await,
        ObserverEvent::StateChanged(SessionState::Connecting)
    );
    session.signaling.wait_for_sent("connect").await;

    tokio::time::sleep(Duration::from_millis(2_900)).await;
    assert_eq!(session.handle.state(), SessionState::Connecting);
    assert!(session.events.try_recv().is_err());

    session.signaling.inject(offer());
    session.signaling.wait_for_sent("answer").await;
    session.media.emit(MediaEvent::Connected);
    assert_eq!(
        session.next_event().await,
        ObserverEvent::StateChanged(SessionState::Connected)
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.handle.state(), SessionState::Connected);
    assert!(session.events.try_recv().is_err());

    session.handle.disconnect();
    assert_eq!(
        session.drain_to_terminal().await.last(),
        Some(&ObserverEvent::StateChanged(SessionState::Closed))
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn late_connected_event_loses_to_the_timer() {
    let mut session = launch(params(Duration::from_secs(3)));
    session.signaling.wait_for_sent("connect").await;
    session.signaling.inject(offer());
    session.signaling.wait_for_sent("answer").await;

    let events = session.drain_to_terminal().await;
    assert_eq!(events.last(), Some(&ObserverEvent::Error(FailureReason::Timeout)));

    assert!(!session.media.emit(MediaEvent::Connected));
    session.assert_quiet().await;
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn redirect_does_not_extend_the_deadline() {
    let started = Instant::now();
    let mut session = launch(params(Duration::from_secs(3)));
    session.signaling.wait_for_sent("connect").await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    session
        .signaling
        .inject(json!({"type": "redirect", "location": "wss://relay-2.example/signaling"}));
    session.signaling.wait_for_sent_nth("connect", 1).await;

    let events = session.drain_to_terminal().await;
    assert_eq!(events.last(), Some(&ObserverEvent::Error(FailureReason::Timeout)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(5));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn default_timeout_is_ten_seconds() {
    let started = Instant::now();
    let mut session = launch(params(relay_session::DEFAULT_CONNECT_TIMEOUT));

    let events = session.drain_to_terminal().await;
    assert_eq!(events.last(), Some(&ObserverEvent::Error(FailureReason::Timeout)));
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn switched_websocket_is_retired_after_a_grace_period() {
    let mut session = launch(params(Duration::from_secs(3)));
    session.connect().await;
    session
        .signaling
        .inject(json!({"type": "switched", "ignore_disconnect_websocket": true}));

    tokio::time::sleep(SIGNALING_RETIRE_DELAY - Duration::from_secs(1)).await;
    assert!(session.signaling.is_open());
    assert_eq!(session.signaling.close_calls(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!session.signaling.is_open());
    assert_eq!(session.signaling.close_calls(), 1);
    assert_eq!(session.handle.state(), SessionState::Connected);
    assert!(session.events.try_recv().is_err());
}
