use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::topic::device_id_from_topic;

#[derive(Debug, thiserror::Error)]
pub enum ReadingError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("field `{0}` has an unexpected type")]
    InvalidField(&'static str),

    #[error("no device id in payload or topic `{0}`")]
    MissingDeviceId(String),
}

/// A normalized telemetry document, as persisted by the reading store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Topic the message arrived on
    pub topic: String,
    /// Capture time on this side of the broker
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    /// Device identifier, taken from the payload or the topic
    pub device_id: String,
    /// Unix seconds reported by the device, or capture time when absent
    pub timestamp: i64,
    /// Channel name to scalar or sample sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<Map<String, Value>>,
    /// Every other payload field, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SensorReading {
    /// Parses `raw` and backfills `device_id` and `timestamp`.
    ///
    /// The checks are shallow: the payload has to be an object, `device_id`
    /// a non-empty string, `timestamp` a number and `sensors` an object.
    /// Channel contents are not inspected.
    pub fn from_payload(
        topic: &str,
        raw: &str,
        namespace: &str,
        received_at: OffsetDateTime,
    ) -> Result<Self, ReadingError> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(raw)? else {
            return Err(ReadingError::NotAnObject);
        };

        let device_id = match fields.remove("device_id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(_) => return Err(ReadingError::InvalidField("device_id")),
            None => device_id_from_topic(topic, namespace)
                .map(str::to_owned)
                .ok_or_else(|| ReadingError::MissingDeviceId(topic.to_string()))?,
        };

        let timestamp = match fields.remove("timestamp") {
            Some(value) => value
                .as_i64()
                .or_else(|| value.as_f64().map(|secs| secs as i64))
                .ok_or(ReadingError::InvalidField("timestamp"))?,
            None => received_at.unix_timestamp(),
        };

        let sensors = match fields.remove("sensors") {
            Some(Value::Object(channels)) => Some(channels),
            Some(_) => return Err(ReadingError::InvalidField("sensors")),
            None => None,
        };

        // capture metadata wins over payload fields of the same name
        fields.remove("topic");
        fields.remove("received_at");

        Ok(Self {
            topic: topic.to_string(),
            received_at,
            device_id,
            timestamp,
            sensors,
            extra: fields,
        })
    }

    pub fn sensors_value(&self) -> Value {
        self.sensors.clone().map(Value::Object).unwrap_or(Value::Null)
    }

    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
