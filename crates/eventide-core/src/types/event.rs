use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event version - strictly monotonic, gap-free from 1.
pub type Version = u64;

/// Per-model reducer output, keyed by model name.
pub type ResultMap = serde_json::Map<String, Value>;

/// Phase-tagged error entries, keyed by `_preprocess_<name>`,
/// `reduce_<name>`, `_apply-<phase>`, `_handle` or `_SQLite`.
pub type ErrorMap = serde_json::Map<String, Value>;

/// An atomic, ordered fact recorded in the queue.
///
/// Before processing only `v`, `type`, `data` and `ts` are populated.
/// Processing fills `result` (success), or `error` plus `failed_result`
/// (failure), and any sub-events emitted along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub v: Version,

    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub data: Value,

    /// Wall-clock seconds at enqueue. Advisory only.
    pub ts: i64,

    /// Per-model changes produced by reducers. Absent before processing,
    /// present (possibly empty) after success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,

    /// Present iff processing failed. Error events do not advance the
    /// persisted version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMap>,

    /// Snapshot of `result` captured when an apply/derive failure rolled
    /// the transaction back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_result: Option<ResultMap>,

    /// Sub-events emitted while processing this event. They share the
    /// parent's `v` and commit within the parent's transaction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SubEvent>,
}

impl Event {
    pub fn new(v: Version, event_type: impl Into<String>, data: Value, ts: i64) -> Self {
        Self {
            v,
            event_type: event_type.into(),
            data,
            ts,
            result: None,
            error: None,
            failed_result: None,
            events: Vec::new(),
        }
    }

    /// Build a processable event from a sub-event, inheriting the parent's
    /// version and timestamp.
    pub fn from_sub(v: Version, ts: i64, sub: &SubEvent) -> Self {
        Self {
            v,
            event_type: sub.event_type.clone(),
            data: sub.data.clone(),
            ts,
            result: None,
            error: None,
            failed_result: None,
            events: sub.events.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Record a single error entry, replacing any previous error map.
    pub fn set_error(&mut self, key: impl Into<String>, message: impl Into<String>) {
        let mut map = ErrorMap::new();
        map.insert(key.into(), Value::String(message.into()));
        self.error = Some(map);
    }

    /// Append a sub-event to be processed within this event's transaction.
    pub fn dispatch(&mut self, event_type: impl Into<String>, data: Value) {
        self.events.push(SubEvent::new(event_type, data));
    }
}

/// An event queued inside the processing of another event.
///
/// Sub-events carry no `v` or `ts` of their own; they inherit the parent's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMap>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SubEvent>,
}

impl SubEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            result: None,
            error: None,
            events: Vec::new(),
        }
    }

    /// Copy the processing outcome of `processed` (built via
    /// [`Event::from_sub`]) back onto this record.
    pub fn absorb(&mut self, processed: Event) {
        self.event_type = processed.event_type;
        self.data = processed.data;
        self.result = processed.result;
        self.error = processed.error;
        self.events = processed.events;
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
