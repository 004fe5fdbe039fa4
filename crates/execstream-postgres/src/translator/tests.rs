use super::*;
use execstream_core::TestExecutionId;
use serde_json::{json, Value};
use uuid::Uuid;

const T1: &str = "2024-05-01T10:00:00Z";
const T2: &str = "2024-05-01T10:05:00Z";

fn test_execution_row(id: Uuid, finish_time: Value) -> Value {
    json!({
        "id": id,
        "test_id": Uuid::new_v4(),
        "has_input": false,
        "schedule_time": T1,
        "start_time": T1,
        "finish_time": finish_time,
        "error": null,
    })
}

fn case_row(exec: Uuid, start_time: Value, finish_time: Value) -> Value {
    json!({
        "id": 1,
        "test_exec_id": exec,
        "case_name": "login",
        "schedule_time": T1,
        "start_time": start_time,
        "finish_time": finish_time,
        "error": null,
    })
}

fn log_row(exec: Uuid) -> Value {
    json!({
        "id": Uuid::new_v4(),
        "test_exec_id": exec,
        "case_exec_id": null,
        "level": "INFO",
        "message": "m",
        "create_time": T1,
    })
}

#[test]
fn test_rule_table() {
    let exec = Uuid::new_v4();
    let cases: Vec<(&str, Action, Value, Option<EventType>)> = vec![
        ("test_executions", Action::Update, test_execution_row(exec, json!(T2)), Some(EventType::TestExecutionFinished)),
        ("test_executions", Action::Update, test_execution_row(exec, Value::Null), None),
        ("test_executions", Action::Insert, test_execution_row(exec, Value::Null), None),
        ("test_executions", Action::Delete, test_execution_row(exec, json!(T2)), None),
        ("case_executions", Action::Insert, case_row(exec, Value::Null, Value::Null), Some(EventType::CaseExecutionScheduled)),
        ("case_executions", Action::Update, case_row(exec, json!(T1), Value::Null), Some(EventType::CaseExecutionStarted)),
        ("case_executions", Action::Update, case_row(exec, json!(T1), json!(T2)), Some(EventType::CaseExecutionFinished)),
        ("case_executions", Action::Update, case_row(exec, Value::Null, json!(T2)), Some(EventType::CaseExecutionFinished)),
        ("case_executions", Action::Update, case_row(exec, Value::Null, Value::Null), None),
        ("case_executions", Action::Delete, case_row(exec, json!(T1), json!(T2)), None),
        ("logs", Action::Insert, log_row(exec), Some(EventType::LogPublished)),
        ("logs", Action::Update, log_row(exec), None),
        ("logs", Action::Delete, log_row(exec), None),
        ("tests", Action::Insert, json!({"id": exec}), None),
        ("tests", Action::Update, json!({}), None),
    ];

    for (table, action, data, expected) in cases {
        let envelope = Envelope::new(table, action, data);
        let event = translate(&envelope).unwrap();
        assert_eq!(
            event.as_ref().map(|e| e.event_type),
            expected,
            "{table} {action}"
        );
        if let Some(event) = event {
            assert_eq!(event.test_execution_id, TestExecutionId::from_uuid(exec));
        }
    }
}

#[test]
fn test_finished_snapshot_matches_row() {
    let exec = Uuid::new_v4();
    let envelope = Envelope::new(
        "test_executions",
        Action::Update,
        test_execution_row(exec, json!(T2)),
    );
    let expected: TestExecutionRow = envelope.row().unwrap();

    let event = translate(&envelope).unwrap().unwrap();
    assert_eq!(event.data, EventData::TestExecution(expected.into_execution()));
    assert_eq!(event.data.data_type(), execstream_core::DataType::TestExecution);
}

#[test]
fn test_event_identity_is_fresh() {
    let exec = Uuid::new_v4();
    let row = log_row(exec);
    let row_id = row["id"].as_str().unwrap().to_string();
    let envelope = Envelope::new("logs", Action::Insert, row);
    let now = Utc::now();

    let first = translate_at(&envelope, now).unwrap().unwrap();
    let second = translate_at(&envelope, now).unwrap().unwrap();

    assert_ne!(first.id, second.id);
    assert_ne!(first.id.to_string(), row_id);
    assert_eq!(first.create_time, now);
}

#[test]
fn test_sparse_rows_fall_back_to_translation_time() {
    let exec = Uuid::new_v4();
    let now = Utc::now();

    let log = Envelope::new(
        "logs",
        Action::Insert,
        json!({"id": Uuid::new_v4(), "test_exec_id": exec, "message": "m"}),
    );
    let event = translate_at(&log, now).unwrap().unwrap();
    match event.data {
        EventData::Log(log) => {
            assert_eq!(log.message, "m");
            assert_eq!(log.create_time, now);
            assert!(log.case_execution_id.is_none());
        }
        other => panic!("unexpected data {other:?}"),
    }

    let case = Envelope::new(
        "case_executions",
        Action::Update,
        json!({"id": 1, "test_exec_id": exec, "start_time": T1, "finish_time": null}),
    );
    let event = translate_at(&case, now).unwrap().unwrap();
    assert_eq!(event.event_type, EventType::CaseExecutionStarted);
    match event.data {
        EventData::CaseExecution(ce) => assert_eq!(ce.schedule_time, now),
        other => panic!("unexpected data {other:?}"),
    }
}

#[test]
fn test_bad_row_is_an_error_only_when_relevant() {
    let bad = json!({"id": "not-a-number", "test_exec_id": "nope"});

    let err = translate(&Envelope::new("case_executions", Action::Insert, bad.clone()))
        .unwrap_err();
    assert!(matches!(err, TranslateError::Row { ref table, .. } if table == "case_executions"));

    // Never-emitting combinations do not decode the row at all.
    assert!(translate(&Envelope::new("case_executions", Action::Delete, bad))
        .unwrap()
        .is_none());
}

#[test]
fn test_nil_execution_id_is_rejected() {
    let envelope = Envelope::new("logs", Action::Insert, log_row(Uuid::nil()));
    assert!(translate(&envelope).is_err());
}
