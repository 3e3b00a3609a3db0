pub mod model;

use serde::{Deserialize, Serialize};

pub use model::{
    Availability, HourlySchedule, Period, PeriodKind, Schedule, ScheduleResponse, Task,
    TaskMethod, TaskUpdate, UserRecord, Visitor, WeekdayIndex,
};

/// Largest inbound WebSocket message accepted by default.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024;

/// Raw `{ "type": ..., "payload": ... }` envelope as read off the wire.
///
/// The payload stays untyped until the tag has been matched so that a bad
/// payload can be told apart from a bad envelope.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Inbound event tags understood by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FetchSchedule,
    CreateTask,
    UpdateTask,
    RemoveTask,
}

impl EventKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "fetch_schedule" => Some(EventKind::FetchSchedule),
            "create_task" => Some(EventKind::CreateTask),
            "update_task" => Some(EventKind::UpdateTask),
            "remove_task" => Some(EventKind::RemoveTask),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            EventKind::FetchSchedule => "fetch_schedule",
            EventKind::CreateTask => "create_task",
            EventKind::UpdateTask => "update_task",
            EventKind::RemoveTask => "remove_task",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FetchSchedulePayload {
    pub period_start: String,
    pub period_end: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPayload {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    /// Comma-joined role list.
    #[serde(default)]
    pub roles: String,
    #[serde(default)]
    pub method: Option<TaskMethod>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskPayload {
    #[serde(default)]
    pub tid: String,
    #[serde(default)]
    pub uid: String,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RemoveTaskPayload {
    #[serde(default)]
    pub tid: String,
    #[serde(default)]
    pub uid: String,
}

/// A decoded inbound event, one variant per supported tag.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    FetchSchedule(FetchSchedulePayload),
    CreateTask(CreateTaskPayload),
    UpdateTask(UpdateTaskPayload),
    RemoveTask(RemoveTaskPayload),
}

impl InboundEvent {
    pub fn decode(kind: EventKind, payload: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EventKind::FetchSchedule => InboundEvent::FetchSchedule(serde_json::from_value(payload)?),
            EventKind::CreateTask => InboundEvent::CreateTask(serde_json::from_value(payload)?),
            EventKind::UpdateTask => InboundEvent::UpdateTask(serde_json::from_value(payload)?),
            EventKind::RemoveTask => InboundEvent::RemoveTask(serde_json::from_value(payload)?),
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::FetchSchedule(_) => EventKind::FetchSchedule,
            InboundEvent::CreateTask(_) => EventKind::CreateTask,
            InboundEvent::UpdateTask(_) => EventKind::UpdateTask,
            InboundEvent::RemoveTask(_) => EventKind::RemoveTask,
        }
    }
}

/// Server-to-client messages, framed with the same envelope as inbound events.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    FetchSchedule(ScheduleResponse),
    CreateTask(TaskCreated),
    UpdateTask(Task),
    RemoveTask(TaskRemoved),
    /// Pushed to every session whose period overlaps a mutation.
    BroadcastSchedule(ScheduleResponse),
    Error(ErrorReply),
}

impl ServerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ServerMessage::FetchSchedule(_) => "fetch_schedule",
            ServerMessage::CreateTask(_) => "create_task",
            ServerMessage::UpdateTask(_) => "update_task",
            ServerMessage::RemoveTask(_) => "remove_task",
            ServerMessage::BroadcastSchedule(_) => "broadcast_schedule",
            ServerMessage::Error(_) => "error",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreated {
    pub task: Task,
    /// Requester id the visitor must present to edit or remove the task.
    pub uid: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRemoved {
    pub removed: u64,
}

/// Structured error reply sent as the payload of an `error` message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    pub err_msg: String,
    pub code_message: String,
    pub conn_code: u16,
}

impl ErrorReply {
    pub fn new(code: ConnCode, message: impl Into<String>) -> Self {
        Self {
            err_msg: message.into(),
            code_message: code.message().to_string(),
            conn_code: code.code(),
        }
    }
}

/// Connection codes: 1000-1014 mirror WebSocket close codes, 4000-4009 are
/// application error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnCode {
    NormalClosure,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    UnsupportedPayload,
    PolicyViolation,
    TooLarge,
    ServerError,
    ServerRestart,
    TryAgainLater,
    BadGateway,
    CacheError,
    NoCacheResult,
    DatabaseError,
    JsonDecodeError,
    JsonEncodeError,
    Timeout,
    TypeCastError,
    TimeParseError,
    MissingData,
    PermissionError,
}

impl ConnCode {
    pub fn code(self) -> u16 {
        match self {
            ConnCode::NormalClosure => 1000,
            ConnCode::GoingAway => 1001,
            ConnCode::ProtocolError => 1002,
            ConnCode::UnsupportedData => 1003,
            ConnCode::UnsupportedPayload => 1007,
            ConnCode::PolicyViolation => 1008,
            ConnCode::TooLarge => 1009,
            ConnCode::ServerError => 1011,
            ConnCode::ServerRestart => 1012,
            ConnCode::TryAgainLater => 1013,
            ConnCode::BadGateway => 1014,
            ConnCode::CacheError => 4000,
            ConnCode::NoCacheResult => 4001,
            ConnCode::DatabaseError => 4002,
            ConnCode::JsonDecodeError => 4003,
            ConnCode::JsonEncodeError => 4004,
            ConnCode::Timeout => 4005,
            ConnCode::TypeCastError => 4006,
            ConnCode::TimeParseError => 4007,
            ConnCode::MissingData => 4008,
            ConnCode::PermissionError => 4009,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ConnCode::NormalClosure => "Normal Closure",
            ConnCode::GoingAway => "Going Away",
            ConnCode::ProtocolError => "Protocol Error",
            ConnCode::UnsupportedData => "Unsupported",
            ConnCode::UnsupportedPayload => "Unsupported Payload",
            ConnCode::PolicyViolation => "Policy Violation",
            ConnCode::TooLarge => "Close Too Large",
            ConnCode::ServerError => "Server Error",
            ConnCode::ServerRestart => "Server Restart",
            ConnCode::TryAgainLater => "Try Again Later",
            ConnCode::BadGateway => "Bad Gateway",
            ConnCode::CacheError => "Cache Error",
            ConnCode::NoCacheResult => "No Cache Results",
            ConnCode::DatabaseError => "Database Error",
            ConnCode::JsonDecodeError => "Json Decode Error",
            ConnCode::JsonEncodeError => "Json Encode Error",
            ConnCode::Timeout => "Timeout",
            ConnCode::TypeCastError => "Type Cast Error",
            ConnCode::TimeParseError => "Time Parse Error",
            ConnCode::MissingData => "Missing Data",
            ConnCode::PermissionError => "Permission Error",
        }
    }
}
