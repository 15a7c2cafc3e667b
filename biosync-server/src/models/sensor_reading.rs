use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::Table;

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorReadingRecord {
    pub id: i64,
    pub topic: String,
    pub received_at: OffsetDateTime,
    pub device_id: String,
    /// Unix seconds
    pub timestamp: i64,
    pub sensors: Option<Value>,
    /// The full normalized document, unknown fields included
    pub payload: Value,
}

/// Projection handed to feature extraction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReadingSample {
    pub device_id: String,
    pub timestamp: i64,
    pub sensors: Option<Value>,
}

impl ReadingSample {
    /// Drops every sensor channel not listed in `channels`.
    pub fn project(mut self, channels: &[&str]) -> Self {
        if let Some(Value::Object(sensors)) = &mut self.sensors {
            sensors.retain(|name, _| channels.contains(&name.as_str()));
        }

        self
    }
}

#[derive(Clone)]
pub struct SensorReadingTable;

impl Table for SensorReadingTable {
    fn name(&self) -> &'static str {
        "sensor_readings"
    }

    fn create(&self) -> String {
        String::from(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic VARCHAR(255) NOT NULL,
                received_at TIMESTAMP NOT NULL,
                device_id VARCHAR(255) NOT NULL,
                timestamp INTEGER NOT NULL,
                sensors JSON,
                payload JSON NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sensor_readings_device_time
                ON sensor_readings (device_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_sensor_readings_time
                ON sensor_readings (timestamp);
            "#,
        )
    }

    fn dispose(&self) -> String {
        String::from("DROP TABLE IF EXISTS sensor_readings;")
    }
}
