//! Typed message model.
//!
//! Every message on the wire has the logical shape
//! `{ "type": string, "payload": object, "timestamp"?: string }`. The `type`
//! selects one variant of [`Event`], so predicates and handlers match on
//! Rust enum variants instead of poking at untyped JSON. Types this crate
//! does not model still route as [`Event::Other`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedMessageError;

/// Prefix marking channels that need an auth token to open.
pub const PRIVATE_CHANNEL_PREFIX: &str = "private-";

/// Logical channel name (e.g. `class-42`, `private-studio-7`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChannelName(String);

impl ChannelName {
    /// Borrow the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether opening this channel requires an auth token.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.0.starts_with(PRIVATE_CHANNEL_PREFIX)
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChannelName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A student referenced by a roster event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRef {
    /// Student id.
    pub id: String,
    /// Display name, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Bulk roster change for a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterUpdate {
    /// Class whose roster changed.
    pub class_id: String,
    /// Current student ids, if the server sends the full list.
    #[serde(default)]
    pub student_ids: Vec<String>,
}

/// One row of a leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// Student id.
    pub student_id: String,
    /// Current score.
    pub score: f64,
    /// 1-based rank, if computed server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

/// Full leaderboard contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardSnapshot {
    /// Class the leaderboard belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
    /// Entries in rank order.
    pub entries: Vec<LeaderboardEntry>,
}

/// Outbound request for the current leaderboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRequest {
    /// Restrict to one class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
    /// Maximum number of entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Progress report for a background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Task id.
    pub task_id: String,
    /// Completion percentage, 0 to 100.
    pub percent: f64,
    /// Human-readable status line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Successful completion of a background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task id.
    pub task_id: String,
    /// Task-specific result.
    #[serde(default)]
    pub result: Value,
}

/// Failed background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Task id.
    pub task_id: String,
    /// Failure description.
    pub error: String,
}

/// Event emitted by the Roblox Studio plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudioEvent {
    /// Studio place the plugin is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
    /// Plugin event name (e.g. `script-saved`, `playtest-started`).
    pub event: String,
    /// Plugin-defined data.
    #[serde(default)]
    pub data: Value,
}

/// A record from an observability stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityRecord {
    /// Severity (`debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emitting service or component.
    pub source: String,
    /// Record text.
    pub message: String,
    /// Structured fields.
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

// =============================================================================
// Event
// =============================================================================

/// Closed set of message types, keyed by the wire `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `student-enrolled`
    StudentEnrolled(StudentRef),
    /// `student-unenrolled`
    StudentUnenrolled(StudentRef),
    /// `roster-updated`
    RosterUpdated(RosterUpdate),
    /// `leaderboard-updated`
    LeaderboardUpdated(LeaderboardSnapshot),
    /// `leaderboard-refresh` (generic refresh trigger, payload ignored)
    LeaderboardRefresh,
    /// `request-leaderboard`
    RequestLeaderboard(LeaderboardRequest),
    /// `task-progress`
    TaskProgress(TaskProgress),
    /// `task-completed`
    TaskCompleted(TaskOutcome),
    /// `task-failed`
    TaskFailed(TaskFailure),
    /// `studio-plugin-event`
    StudioPlugin(StudioEvent),
    /// `observability-record`
    Observability(ObservabilityRecord),
    /// Any other well-formed type.
    Other {
        /// The wire `type`.
        kind: String,
        /// Raw payload.
        payload: Value,
    },
}

impl Event {
    /// Wire `type` of this event.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::StudentEnrolled(_) => "student-enrolled",
            Self::StudentUnenrolled(_) => "student-unenrolled",
            Self::RosterUpdated(_) => "roster-updated",
            Self::LeaderboardUpdated(_) => "leaderboard-updated",
            Self::LeaderboardRefresh => "leaderboard-refresh",
            Self::RequestLeaderboard(_) => "request-leaderboard",
            Self::TaskProgress(_) => "task-progress",
            Self::TaskCompleted(_) => "task-completed",
            Self::TaskFailed(_) => "task-failed",
            Self::StudioPlugin(_) => "studio-plugin-event",
            Self::Observability(_) => "observability-record",
            Self::Other { kind, .. } => kind,
        }
    }

    /// Decode a payload according to its declared `type`.
    pub fn decode(kind: &str, payload: Value) -> Result<Self, MalformedMessageError> {
        let invalid = |e: serde_json::Error| MalformedMessageError::InvalidPayload {
            kind: kind.to_string(),
            reason: e.to_string(),
        };

        Ok(match kind {
            "student-enrolled" => Self::StudentEnrolled(serde_json::from_value(payload).map_err(invalid)?),
            "student-unenrolled" => {
                Self::StudentUnenrolled(serde_json::from_value(payload).map_err(invalid)?)
            }
            "roster-updated" => Self::RosterUpdated(serde_json::from_value(payload).map_err(invalid)?),
            "leaderboard-updated" => {
                Self::LeaderboardUpdated(serde_json::from_value(payload).map_err(invalid)?)
            }
            "leaderboard-refresh" => Self::LeaderboardRefresh,
            "request-leaderboard" => {
                // Absent payload means "everything".
                let payload = if payload.is_null() { Value::Object(serde_json::Map::new()) } else { payload };
                Self::RequestLeaderboard(serde_json::from_value(payload).map_err(invalid)?)
            }
            "task-progress" => Self::TaskProgress(serde_json::from_value(payload).map_err(invalid)?),
            "task-completed" => Self::TaskCompleted(serde_json::from_value(payload).map_err(invalid)?),
            "task-failed" => Self::TaskFailed(serde_json::from_value(payload).map_err(invalid)?),
            "studio-plugin-event" => Self::StudioPlugin(serde_json::from_value(payload).map_err(invalid)?),
            "observability-record" => {
                Self::Observability(serde_json::from_value(payload).map_err(invalid)?)
            }
            other => Self::Other {
                kind: other.to_string(),
                payload,
            },
        })
    }

    /// Encode the payload half of the wire shape.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::StudentEnrolled(p) | Self::StudentUnenrolled(p) => to_payload(p),
            Self::RosterUpdated(p) => to_payload(p),
            Self::LeaderboardUpdated(p) => to_payload(p),
            Self::LeaderboardRefresh => Value::Object(serde_json::Map::new()),
            Self::RequestLeaderboard(p) => to_payload(p),
            Self::TaskProgress(p) => to_payload(p),
            Self::TaskCompleted(p) => to_payload(p),
            Self::TaskFailed(p) => to_payload(p),
            Self::StudioPlugin(p) => to_payload(p),
            Self::Observability(p) => to_payload(p),
            Self::Other { payload, .. } => payload.clone(),
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        log::warn!("[Message] Failed to encode payload: {e}");
        Value::Null
    })
}

// =============================================================================
// Message
// =============================================================================

/// Unit of data flowing in both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Typed event (carries the wire `type` and payload).
    pub event: Event,
    /// Channel the message arrived on or is addressed to.
    pub channel: Option<ChannelName>,
    /// RFC 3339 timestamp, when known.
    pub timestamp: Option<String>,
}

impl Message {
    /// Wrap an event with no channel or timestamp.
    #[must_use]
    pub fn new(event: Event) -> Self {
        Self {
            event,
            channel: None,
            timestamp: None,
        }
    }

    /// Wire `type` of the message.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.event.kind()
    }

    /// Parse and validate an inbound wire message.
    ///
    /// Only a missing or non-string `type` (or a non-object body) is
    /// malformed. A known type whose payload does not fit its typed shape
    /// still routes, as [`Event::Other`] with the raw payload.
    pub fn from_wire(value: Value) -> Result<Self, MalformedMessageError> {
        let Value::Object(mut obj) = value else {
            return Err(MalformedMessageError::NotAnObject);
        };

        let kind = match obj.remove("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            _ => return Err(MalformedMessageError::MissingType),
        };
        let payload = obj.remove("payload").unwrap_or(Value::Null);

        let event = match Event::decode(&kind, payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("[Message] Untyped {kind}: {e}");
                Event::Other { kind, payload }
            }
        };

        Ok(Self {
            event,
            channel: obj
                .get("channel")
                .and_then(Value::as_str)
                .map(ChannelName::from),
            timestamp: obj
                .get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Encode as `{ type, payload, timestamp? }`.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), Value::String(self.kind().to_string()));
        obj.insert("payload".to_string(), self.event.payload());
        if let Some(ts) = &self.timestamp {
            obj.insert("timestamp".to_string(), Value::String(ts.clone()));
        }
        Value::Object(obj)
    }

    /// Attach a channel if the message does not carry one.
    #[must_use]
    pub fn on_channel(mut self, channel: &ChannelName) -> Self {
        if self.channel.is_none() {
            self.channel = Some(channel.clone());
        }
        self
    }

    /// Stamp the current time if no timestamp is set.
    #[must_use]
    pub fn stamped(mut self) -> Self {
        if self.timestamp.is_none() {
            self.timestamp = Some(chrono::Utc::now().to_rfc3339());
        }
        self
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self::new(event)
    }
}
