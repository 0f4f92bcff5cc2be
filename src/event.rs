use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Event type assigned to the synthetic record emitted on every stream open.
pub const CONNECTION_ESTABLISHED: &str = "connection.established";

/// Routing priority carried in unified event metadata.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// True for priorities routed through the high-priority path.
    pub fn is_elevated(self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }
}

impl<'de> Deserialize<'de> for Priority {
    /// Unknown wire values degrade to `normal` instead of invalidating the
    /// whole record.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "low" => Priority::Low,
            "high" => Priority::High,
            "critical" => Priority::Critical,
            _ => Priority::Normal,
        })
    }
}

/// Optional unified metadata riding inside an event record.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One discrete, independently parseable unit of server-pushed data.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

/// Reasons a raw payload is rejected before dispatch.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing or empty required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` must be a string")]
    FieldType(&'static str),

    #[error("field `{0}` must be an object when present")]
    NotAnObjectField(&'static str),

    #[error("record failed to decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl EventRecord {
    /// Validates a raw payload against the record invariants and decodes it.
    ///
    /// A record missing `id`, `type`, or `timestamp`, carrying non-string
    /// values for those fields, or carrying a non-object `data`/`metadata`
    /// is rejected and must never reach a listener.
    pub fn from_value(value: Value) -> Result<Self, RecordError> {
        let object = value.as_object().ok_or(RecordError::NotAnObject)?;

        for field in ["id", "type", "timestamp"] {
            match object.get(field) {
                None | Some(Value::Null) => return Err(RecordError::MissingField(field)),
                Some(Value::String(text)) if text.is_empty() => {
                    return Err(RecordError::MissingField(field));
                }
                Some(Value::String(_)) => {}
                Some(_) => return Err(RecordError::FieldType(field)),
            }
        }

        for field in ["data", "metadata"] {
            if let Some(present) = object.get(field) {
                if !present.is_null() && !present.is_object() {
                    return Err(RecordError::NotAnObjectField(field));
                }
            }
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Synthetic record dispatched when a stream session opens.
    pub fn connection_established() -> Self {
        let now = Utc::now();
        Self {
            id: format!("conn-{}", now.timestamp_millis()),
            event_type: CONNECTION_ESTABLISHED.to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            data: None,
            metadata: Some(EventMetadata {
                category: Some("system".to_string()),
                priority: Some(Priority::Normal),
                source_system: None,
                correlation_id: None,
                extra: Map::new(),
            }),
        }
    }

    /// Effective priority; absent metadata means `normal`.
    pub fn priority(&self) -> Priority {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.priority)
            .unwrap_or_default()
    }

    /// Routing category, when the record carries one.
    pub fn category(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.category.as_deref())
    }
}
