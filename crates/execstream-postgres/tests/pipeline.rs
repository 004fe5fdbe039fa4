//! Repository mutations flowing through listener, translator and broker

use std::time::Duration;

use chrono::Utc;
use execstream_core::{
    CaseExecutionWriter, EventData, EventType, ExecutionEvent, ExecutionLog,
    FinishedCaseExecution, FinishedTestExecution, LogWriter, MemoryRepository, ResetTestExecution,
    ScheduledCaseExecution, ScheduledTestExecution, StartedCaseExecution, StartedTestExecution,
    TestDefinition, TestExecution, TestExecutionId, TestExecutionWriter, TestWriter,
};
use execstream_postgres::{ChannelListener, EventSource, EventsConfig, SourceError};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    repo: MemoryRepository,
    source: EventSource<ChannelListener>,
    errors: mpsc::Receiver<SourceError>,
}

impl Harness {
    fn new() -> Self {
        let (tx, listener) = ChannelListener::channel();
        let repo = MemoryRepository::with_notifier(tx);
        let source = EventSource::new(listener, &EventsConfig::default());
        Self {
            repo,
            source,
            errors: mpsc::channel(1).1,
        }
    }

    fn start(&mut self) {
        self.errors = self.source.start(CancellationToken::new()).unwrap();
    }

    async fn schedule(&self) -> TestExecution {
        let test = self
            .repo
            .create_test(&TestDefinition::new("e2e", "checkout", "runner-1"))
            .await
            .unwrap();
        self.repo
            .create_scheduled_test_execution(&ScheduledTestExecution {
                id: TestExecutionId::new(),
                test_id: test.id,
                has_input: false,
                schedule_time: Utc::now(),
            })
            .await
            .unwrap()
    }
}

async fn next(rx: &mut mpsc::Receiver<ExecutionEvent>) -> ExecutionEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<ExecutionEvent>) {
    assert!(
        timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
        "unexpected event"
    );
}

#[tokio::test]
async fn test_log_insert_publishes_log_event() {
    let mut h = Harness::new();
    h.start();
    let te = h.schedule().await;
    let (mut events, _unsub) = h.source.subscribe(te.id);

    h.repo
        .create_log(&ExecutionLog::new(te.id, "INFO", "m"))
        .await
        .unwrap();

    let event = next(&mut events).await;
    assert_eq!(event.event_type, EventType::LogPublished);
    assert_eq!(event.test_execution_id, te.id);
    match event.data {
        EventData::Log(log) => assert_eq!(log.message, "m"),
        other => panic!("unexpected data {other:?}"),
    }
    assert_quiet(&mut events).await;
    h.source.stop().await;
}

#[tokio::test]
async fn test_case_lifecycle_in_order() {
    let mut h = Harness::new();
    h.start();
    let te = h.schedule().await;
    let (mut events, _unsub) = h.source.subscribe(te.id);

    let ce = h
        .repo
        .create_scheduled_case_execution(&ScheduledCaseExecution {
            test_execution_id: te.id,
            case_name: "add to cart".into(),
            schedule_time: Utc::now(),
        })
        .await
        .unwrap();
    h.repo
        .update_started_case_execution(&StartedCaseExecution {
            id: ce.id,
            test_execution_id: te.id,
            start_time: Utc::now(),
        })
        .await
        .unwrap();
    h.repo
        .update_finished_case_execution(&FinishedCaseExecution {
            id: ce.id,
            test_execution_id: te.id,
            finish_time: Utc::now(),
            error: None,
        })
        .await
        .unwrap();

    let types = [
        next(&mut events).await.event_type,
        next(&mut events).await.event_type,
        next(&mut events).await.event_type,
    ];
    assert_eq!(
        types,
        [
            EventType::CaseExecutionScheduled,
            EventType::CaseExecutionStarted,
            EventType::CaseExecutionFinished,
        ]
    );
    h.source.stop().await;
}

#[tokio::test]
async fn test_finish_publishes_exactly_once() {
    let mut h = Harness::new();
    h.start();
    let te = h.schedule().await;
    let (mut events, _unsub) = h.source.subscribe(te.id);

    h.repo
        .update_started_test_execution(&StartedTestExecution {
            id: te.id,
            start_time: Utc::now(),
        })
        .await
        .unwrap();
    let finished = h
        .repo
        .update_finished_test_execution(&FinishedTestExecution {
            id: te.id,
            finish_time: Utc::now(),
            error: Some("assertion failed".into()),
        })
        .await
        .unwrap();

    let event = next(&mut events).await;
    assert_eq!(event.event_type, EventType::TestExecutionFinished);
    assert_eq!(event.data, EventData::TestExecution(finished));
    assert_quiet(&mut events).await;
    h.source.stop().await;
}

#[tokio::test]
async fn test_two_subscribers_see_identical_events() {
    let mut h = Harness::new();
    h.start();
    let te = h.schedule().await;
    let (mut first, _u1) = h.source.subscribe(te.id);
    let (mut second, _u2) = h.source.subscribe(te.id);

    for message in ["one", "two"] {
        h.repo
            .create_log(&ExecutionLog::new(te.id, "INFO", message))
            .await
            .unwrap();
    }

    for _ in 0..2 {
        assert_eq!(next(&mut first).await, next(&mut second).await);
    }
    h.source.stop().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let mut h = Harness::new();
    h.start();
    let te = h.schedule().await;
    let (mut events, unsub) = h.source.subscribe(te.id);

    unsub.unsubscribe();
    h.repo
        .create_log(&ExecutionLog::new(te.id, "INFO", "late"))
        .await
        .unwrap();

    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
    h.source.stop().await;
}

#[tokio::test]
async fn test_reset_emits_no_lifecycle_events() {
    let mut h = Harness::new();
    h.start();
    let te = h.schedule().await;
    h.repo
        .create_scheduled_case_execution(&ScheduledCaseExecution {
            test_execution_id: te.id,
            case_name: "c".into(),
            schedule_time: Utc::now(),
        })
        .await
        .unwrap();
    let (mut events, _unsub) = h.source.subscribe(te.id);

    let (reset, _rollback) = h
        .repo
        .reset_test_execution(&ResetTestExecution {
            id: te.id,
            reset_time: Utc::now(),
        })
        .await
        .unwrap();
    assert!(reset.finish_time.is_none());

    // Case deletes and the cleared row translate to nothing.
    assert_quiet(&mut events).await;
    assert!(h.errors.try_recv().is_err());
    h.source.stop().await;
}

#[tokio::test]
async fn test_subscribe_before_start_receives_after_start() {
    let mut h = Harness::new();
    let te = h.schedule().await;
    let (mut events, _unsub) = h.source.subscribe(te.id);

    h.start();
    h.repo
        .create_log(&ExecutionLog::new(te.id, "WARN", "hello"))
        .await
        .unwrap();

    assert_eq!(next(&mut events).await.event_type, EventType::LogPublished);
    h.source.stop().await;
    assert!(events.recv().await.is_none());
}
