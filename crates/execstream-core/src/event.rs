//! Event - Execution events published by the pipeline
//!
//! An [`ExecutionEvent`] carries a type tag and at most one entity snapshot.
//! Its serialized form is the wire shape handed to streaming clients: a type
//! tag, a nested data wrapper with its own type tag, and identity/time
//! fields. Unknown tags decode to `Unspecified` instead of failing so that
//! older consumers keep working when new event kinds appear.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::execution::{CaseExecution, ExecutionLog, TestExecution, TestExecutionId};

/// Execution event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum EventType {
    /// Unknown or missing tag
    Unspecified,
    /// Test execution scheduled
    TestExecutionScheduled,
    /// Test execution started
    TestExecutionStarted,
    /// Test execution finished (successfully or not)
    TestExecutionFinished,
    /// Case execution scheduled
    CaseExecutionScheduled,
    /// Case execution started
    CaseExecutionStarted,
    /// Case execution finished
    CaseExecutionFinished,
    /// Log line published
    LogPublished,
}

impl EventType {
    /// Returns the wire tag of the event type
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "TYPE_UNSPECIFIED",
            Self::TestExecutionScheduled => "TYPE_TEST_EXECUTION_SCHEDULED",
            Self::TestExecutionStarted => "TYPE_TEST_EXECUTION_STARTED",
            Self::TestExecutionFinished => "TYPE_TEST_EXECUTION_FINISHED",
            Self::CaseExecutionScheduled => "TYPE_CASE_EXECUTION_SCHEDULED",
            Self::CaseExecutionStarted => "TYPE_CASE_EXECUTION_STARTED",
            Self::CaseExecutionFinished => "TYPE_CASE_EXECUTION_FINISHED",
            Self::LogPublished => "TYPE_LOG_PUBLISHED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "TYPE_TEST_EXECUTION_SCHEDULED" => Self::TestExecutionScheduled,
            "TYPE_TEST_EXECUTION_STARTED" => Self::TestExecutionStarted,
            "TYPE_TEST_EXECUTION_FINISHED" => Self::TestExecutionFinished,
            "TYPE_CASE_EXECUTION_SCHEDULED" => Self::CaseExecutionScheduled,
            "TYPE_CASE_EXECUTION_STARTED" => Self::CaseExecutionStarted,
            "TYPE_CASE_EXECUTION_FINISHED" => Self::CaseExecutionFinished,
            "TYPE_LOG_PUBLISHED" => Self::LogPublished,
            _ => Self::Unspecified,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<EventType> for &'static str {
    fn from(t: EventType) -> Self {
        t.as_str()
    }
}

/// Discriminant of the payload attached to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum DataType {
    /// Unknown or missing tag
    Unspecified,
    /// No payload
    None,
    /// Test execution snapshot
    TestExecution,
    /// Case execution snapshot
    CaseExecution,
    /// Log snapshot
    Log,
}

impl DataType {
    /// Returns the wire tag of the data type
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "TYPE_UNSPECIFIED",
            Self::None => "TYPE_NONE",
            Self::TestExecution => "TYPE_TEST_EXECUTION",
            Self::CaseExecution => "TYPE_CASE_EXECUTION",
            Self::Log => "TYPE_LOG",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for DataType {
    fn from(s: &str) -> Self {
        match s {
            "TYPE_NONE" => Self::None,
            "TYPE_TEST_EXECUTION" => Self::TestExecution,
            "TYPE_CASE_EXECUTION" => Self::CaseExecution,
            "TYPE_LOG" => Self::Log,
            _ => Self::Unspecified,
        }
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<DataType> for &'static str {
    fn from(t: DataType) -> Self {
        t.as_str()
    }
}

/// Snapshot attached to an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// No payload
    None,
    /// Test execution snapshot
    TestExecution(TestExecution),
    /// Case execution snapshot
    CaseExecution(CaseExecution),
    /// Log snapshot
    Log(ExecutionLog),
}

impl EventData {
    /// Discriminant matching the populated variant
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::None => DataType::None,
            Self::TestExecution(_) => DataType::TestExecution,
            Self::CaseExecution(_) => DataType::CaseExecution,
            Self::Log(_) => DataType::Log,
        }
    }
}

/// An event in the lifecycle of a test execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEvent", try_from = "WireEvent")]
pub struct ExecutionEvent {
    /// Unique identifier, independent of any row id
    pub id: Uuid,
    /// Owning test execution (fan-out topic)
    pub test_execution_id: TestExecutionId,
    /// Type of event
    pub event_type: EventType,
    /// Attached snapshot
    pub data: EventData,
    /// When the event was produced
    pub create_time: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Create a new event with a fresh id, stamped now
    #[must_use]
    pub fn new(test_execution_id: TestExecutionId, event_type: EventType, data: EventData) -> Self {
        Self {
            id: Uuid::new_v4(),
            test_execution_id,
            event_type,
            data,
            create_time: Utc::now(),
        }
    }

    /// Override the creation time
    #[must_use]
    pub fn with_create_time(mut self, create_time: DateTime<Utc>) -> Self {
        self.create_time = create_time;
        self
    }

    /// Convert into the wire representation
    #[must_use]
    pub fn to_wire(&self) -> WireEvent {
        let mut data = WireEventData {
            data_type: self.data.data_type(),
            test_execution: None,
            case_execution: None,
            log: None,
        };
        match &self.data {
            EventData::None => {}
            EventData::TestExecution(te) => data.test_execution = Some(te.clone()),
            EventData::CaseExecution(ce) => data.case_execution = Some(ce.clone()),
            EventData::Log(log) => data.log = Some(log.clone()),
        }

        WireEvent {
            event_id: self.id,
            test_execution_id: self.test_execution_id,
            event_type: self.event_type,
            data,
            create_time: self.create_time,
        }
    }
}

/// Wire representation of an [`ExecutionEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Event identifier
    pub event_id: Uuid,
    /// Owning test execution
    pub test_execution_id: TestExecutionId,
    /// Event type tag
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Payload wrapper
    pub data: WireEventData,
    /// Creation time
    pub create_time: DateTime<Utc>,
}

/// Wire payload wrapper: a type tag plus at most one populated slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEventData {
    /// Data type tag
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Test execution slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_execution: Option<TestExecution>,
    /// Case execution slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_execution: Option<CaseExecution>,
    /// Log slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<ExecutionLog>,
}

impl From<ExecutionEvent> for WireEvent {
    fn from(event: ExecutionEvent) -> Self {
        event.to_wire()
    }
}

impl TryFrom<WireEvent> for ExecutionEvent {
    type Error = Error;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        if wire.test_execution_id.is_nil() {
            return Err(Error::Serialization(
                "event has no test execution id".to_string(),
            ));
        }

        // A tag that disagrees with the populated slot decodes as no payload.
        let WireEventData {
            data_type,
            test_execution,
            case_execution,
            log,
        } = wire.data;
        let data = match (data_type, test_execution, case_execution, log) {
            (DataType::TestExecution, Some(te), _, _) => EventData::TestExecution(te),
            (DataType::CaseExecution, _, Some(ce), _) => EventData::CaseExecution(ce),
            (DataType::Log, _, _, Some(log)) => EventData::Log(log),
            _ => EventData::None,
        };

        Ok(Self {
            id: wire.event_id,
            test_execution_id: wire.test_execution_id,
            event_type: wire.event_type,
            data,
            create_time: wire.create_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::CaseExecutionId;

    fn case_snapshot(exec_id: TestExecutionId) -> CaseExecution {
        CaseExecution {
            id: CaseExecutionId::new(1),
            test_execution_id: exec_id,
            case_name: "login".to_string(),
            schedule_time: Utc::now(),
            start_time: Some(Utc::now()),
            finish_time: None,
            error: None,
        }
    }

    #[test]
    fn test_event_type_tags() {
        for event_type in [
            EventType::TestExecutionScheduled,
            EventType::TestExecutionStarted,
            EventType::TestExecutionFinished,
            EventType::CaseExecutionScheduled,
            EventType::CaseExecutionStarted,
            EventType::CaseExecutionFinished,
            EventType::LogPublished,
        ] {
            assert_eq!(EventType::from(event_type.as_str()), event_type);
        }
    }

    #[test]
    fn test_unknown_tags_collapse_to_unspecified() {
        let parsed: EventType = serde_json::from_str(r#""TYPE_TEST_EXECUTION_PAUSED""#).unwrap();
        assert_eq!(parsed, EventType::Unspecified);

        let parsed: DataType = serde_json::from_str(r#""TYPE_ARTIFACT""#).unwrap();
        assert_eq!(parsed, DataType::Unspecified);
    }

    #[test]
    fn test_data_type_follows_payload() {
        let exec_id = TestExecutionId::new();
        assert_eq!(EventData::None.data_type(), DataType::None);
        assert_eq!(
            EventData::CaseExecution(case_snapshot(exec_id)).data_type(),
            DataType::CaseExecution
        );
    }

    #[test]
    fn test_event_serialization_shape() {
        let exec_id = TestExecutionId::new();
        let event = ExecutionEvent::new(
            exec_id,
            EventType::CaseExecutionStarted,
            EventData::CaseExecution(case_snapshot(exec_id)),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TYPE_CASE_EXECUTION_STARTED");
        assert_eq!(json["data"]["type"], "TYPE_CASE_EXECUTION");
        assert_eq!(json["data"]["case_execution"]["case_name"], "login");
        assert!(json["data"].get("log").is_none());
        assert_eq!(json["event_id"], event.id.to_string());
        assert_eq!(json["test_execution_id"], exec_id.to_string());

        let decoded: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_mismatched_data_tag_decodes_as_none() {
        let exec_id = TestExecutionId::new();
        let json = serde_json::json!({
            "event_id": Uuid::new_v4(),
            "test_execution_id": exec_id,
            "type": "TYPE_LOG_PUBLISHED",
            "data": { "type": "TYPE_TEST_EXECUTION" },
            "create_time": Utc::now(),
        });

        let decoded: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.data, EventData::None);
        assert_eq!(decoded.event_type, EventType::LogPublished);
    }

    #[test]
    fn test_nil_topic_rejected() {
        let json = serde_json::json!({
            "event_id": Uuid::new_v4(),
            "test_execution_id": Uuid::nil(),
            "type": "TYPE_LOG_PUBLISHED",
            "data": { "type": "TYPE_NONE" },
            "create_time": Utc::now(),
        });

        assert!(serde_json::from_value::<ExecutionEvent>(json).is_err());
    }
}
