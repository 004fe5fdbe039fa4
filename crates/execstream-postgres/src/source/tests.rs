use super::*;
use std::collections::VecDeque;
use std::time::Duration;

use execstream_core::EventType;
use serde_json::json;
use tokio::time::timeout;
use tokio_test::assert_ok;
use uuid::Uuid;

use crate::envelope::{Action, Envelope};
use crate::listener::{ChannelListener, MockChangeListener};

const WAIT: Duration = Duration::from_secs(2);

fn config(subscriber_buffer: usize) -> EventsConfig {
    EventsConfig {
        subscriber_buffer,
        ..EventsConfig::default()
    }
}

fn log_envelope(exec: Uuid, message: &str) -> Envelope {
    Envelope::new(
        "logs",
        Action::Insert,
        json!({"id": Uuid::new_v4(), "test_exec_id": exec, "message": message}),
    )
}

/// Mock listener that replays `script`, then reports cancellation
fn scripted(script: Vec<Result<Envelope, ListenError>>) -> MockChangeListener {
    let mut script = VecDeque::from(script);
    let mut listener = MockChangeListener::new();
    listener
        .expect_wait_next()
        .returning(move |_| script.pop_front().unwrap_or(Err(ListenError::Cancelled)));
    listener.expect_release().times(1).return_const(());
    listener
}

#[tokio::test]
async fn test_errors_are_reported_and_loop_continues() {
    let exec = Uuid::new_v4();
    let listener = scripted(vec![
        Err(ListenError::Decode("bad json".into())),
        Ok(Envelope::new("case_executions", Action::Insert, json!({"id": "x"}))),
        Ok(log_envelope(exec, "after errors")),
        Err(ListenError::ConnectionLost),
    ]);

    let mut source = EventSource::new(listener, &config(8));
    let (mut events, _unsub) = source.subscribe(TestExecutionId::from_uuid(exec));
    let mut errors = source.start(CancellationToken::new()).unwrap();

    let first = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(first, SourceError::Listen(ListenError::Decode(_))));
    let second = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(second, SourceError::Translate(_)));
    let third = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(third, SourceError::Listen(ListenError::ConnectionLost)));
    assert!(timeout(WAIT, errors.recv()).await.unwrap().is_none());

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, EventType::LogPublished);
    // Connection loss stops the broker, closing subscribers.
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());

    source.stop().await;
}

#[tokio::test]
async fn test_cancel_closes_error_stream_silently() {
    let (_tx, listener) = ChannelListener::channel();
    let mut source = EventSource::new(listener, &EventsConfig::default());
    let (mut events, _unsub) = source.subscribe(TestExecutionId::new());
    let cancel = CancellationToken::new();
    let mut errors = source.start(cancel.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    assert!(timeout(WAIT, errors.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
    source.stop().await;
    assert!(!source.is_running());
}

#[tokio::test]
async fn test_stop_releases_connection_once() {
    let mut listener = MockChangeListener::new();
    listener
        .expect_wait_next()
        .returning(|_| Err(ListenError::Cancelled));
    listener.expect_release().times(1).return_const(());

    let mut source = EventSource::new(listener, &EventsConfig::default());
    let _errors = source.start(CancellationToken::new()).unwrap();
    source.stop().await;
    source.stop().await;
}

#[tokio::test]
async fn test_stop_before_start_releases_listener() {
    let mut listener = MockChangeListener::new();
    listener.expect_release().times(1).return_const(());

    let mut source = EventSource::new(listener, &EventsConfig::default());
    let (mut events, _unsub) = source.subscribe(TestExecutionId::new());
    source.stop().await;

    assert!(events.recv().await.is_none());
    assert!(matches!(
        source.start(CancellationToken::new()),
        Err(SourceError::Stopped)
    ));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (_tx, listener) = ChannelListener::channel();
    let mut source = EventSource::new(listener, &EventsConfig::default());
    let cancel = CancellationToken::new();

    let _errors = assert_ok!(source.start(cancel.clone()));
    assert!(matches!(
        source.start(cancel),
        Err(SourceError::AlreadyStarted)
    ));
    assert!(source.is_running());
    source.stop().await;
}

#[tokio::test]
async fn test_events_route_by_execution() {
    let (tx, listener) = ChannelListener::channel();
    let mut source = EventSource::new(listener, &EventsConfig::default());
    let exec_a = Uuid::new_v4();
    let exec_b = Uuid::new_v4();
    let (mut rx_a, _ua) = source.subscribe(TestExecutionId::from_uuid(exec_a));
    let (mut rx_b, _ub) = source.subscribe(TestExecutionId::from_uuid(exec_b));
    let _errors = source.start(CancellationToken::new()).unwrap();

    for (exec, message) in [(exec_a, "a1"), (exec_b, "b1"), (exec_a, "a2")] {
        tx.send(serde_json::to_string(&log_envelope(exec, message)).unwrap())
            .unwrap();
    }

    let messages = |event: ExecutionEvent| match event.data {
        execstream_core::EventData::Log(log) => log.message,
        other => panic!("unexpected data {other:?}"),
    };
    assert_eq!(messages(timeout(WAIT, rx_a.recv()).await.unwrap().unwrap()), "a1");
    assert_eq!(messages(timeout(WAIT, rx_a.recv()).await.unwrap().unwrap()), "a2");
    assert_eq!(messages(timeout(WAIT, rx_b.recv()).await.unwrap().unwrap()), "b1");

    source.stop().await;
    assert!(rx_a.recv().await.is_none());
    assert_eq!(source.dropped_events(), 0);
}

#[tokio::test]
async fn test_slow_subscriber_counts_drops() {
    let (tx, listener) = ChannelListener::channel();
    let mut source = EventSource::new(listener, &config(1));
    let exec = Uuid::new_v4();
    let (mut slow, _slow_unsub) = source.subscribe(TestExecutionId::from_uuid(exec));
    let (mut fast, _fast_unsub) = source.subscribe(TestExecutionId::from_uuid(exec));
    let _errors = source.start(CancellationToken::new()).unwrap();

    for n in 0..3 {
        tx.send(serde_json::to_string(&log_envelope(exec, &n.to_string())).unwrap())
            .unwrap();
        timeout(WAIT, fast.recv()).await.unwrap().unwrap();
    }

    assert_eq!(source.dropped_events(), 2);
    assert!(slow.recv().await.is_some());
    source.stop().await;
}
