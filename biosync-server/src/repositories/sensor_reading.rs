use std::sync::Arc;

use biosync_api::SensorReading;
use serde_json::Value;
use time::OffsetDateTime;

use crate::configs::Storage;
use crate::errors::{IngestError, PersistenceError};
use crate::models::{ReadingSample, SensorReadingRecord};

/// Channels kept by [`SensorReadingRepository::fetch_recent`].
pub const DEFAULT_CHANNELS: [&str; 2] = ["eda", "ppg"];

pub const DEFAULT_RECENT_WINDOW_MINUTES: i64 = 6;

#[derive(Clone)]
pub struct SensorReadingRepository {
    storage: Arc<Storage>,
    namespace: String,
    recent_window_minutes: i64,
}

impl SensorReadingRepository {
    pub fn new(storage: Arc<Storage>, namespace: impl Into<String>) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            recent_window_minutes: DEFAULT_RECENT_WINDOW_MINUTES,
        }
    }

    /// Window used by [`Self::fetch_recent_default`].
    pub fn with_recent_window(mut self, minutes: i64) -> Self {
        self.recent_window_minutes = minutes;
        self
    }

    pub fn recent_window_minutes(&self) -> i64 {
        self.recent_window_minutes
    }
}

impl SensorReadingRepository {
    /// Normalizes a raw payload and stores it.
    ///
    /// Malformed payloads come back as [`IngestError::Decode`] and nothing is
    /// written.
    pub async fn append(
        &self,
        topic: &str,
        payload: &str,
        received_at: OffsetDateTime,
    ) -> Result<i64, IngestError> {
        let reading = SensorReading::from_payload(topic, payload, &self.namespace, received_at)?;

        Ok(self.create(&reading).await?)
    }

    pub async fn create(&self, reading: &SensorReading) -> Result<i64, PersistenceError> {
        let document = reading.to_document()?;

        let result = self
            .storage
            .run(
                sqlx::query(
                    r#"
                    INSERT INTO sensor_readings (topic, received_at, device_id, timestamp, sensors, payload)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&reading.topic)
                .bind(reading.received_at)
                .bind(&reading.device_id)
                .bind(reading.timestamp)
                .bind(reading.sensors.clone().map(Value::Object))
                .bind(document)
                .execute(self.storage.get_pool()),
            )
            .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<SensorReadingRecord>, PersistenceError> {
        self.storage
            .run(
                sqlx::query_as("SELECT * FROM sensor_readings WHERE id = $1")
                    .bind(id)
                    .fetch_optional(self.storage.get_pool()),
            )
            .await
    }

    /// Samples of a device with `start <= timestamp <= end`, oldest first.
    pub async fn fetch_range(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ReadingSample>, PersistenceError> {
        self.storage
            .run(
                sqlx::query_as(
                    r#"
                    SELECT device_id, timestamp, sensors FROM sensor_readings
                    WHERE device_id = $1 AND timestamp >= $2 AND timestamp <= $3
                    ORDER BY timestamp ASC, id ASC
                    "#,
                )
                .bind(device_id)
                .bind(start)
                .bind(end)
                .fetch_all(self.storage.get_pool()),
            )
            .await
    }

    /// Samples from the last `window_minutes`, restricted to [`DEFAULT_CHANNELS`].
    pub async fn fetch_recent(
        &self,
        device_id: &str,
        window_minutes: i64,
    ) -> Result<Vec<ReadingSample>, PersistenceError> {
        self.fetch_recent_channels(device_id, window_minutes, &DEFAULT_CHANNELS)
            .await
    }

    /// [`Self::fetch_recent`] over the configured window.
    pub async fn fetch_recent_default(&self, device_id: &str) -> Result<Vec<ReadingSample>, PersistenceError> {
        self.fetch_recent(device_id, self.recent_window_minutes).await
    }

    pub async fn fetch_recent_channels(
        &self,
        device_id: &str,
        window_minutes: i64,
        channels: &[&str],
    ) -> Result<Vec<ReadingSample>, PersistenceError> {
        if window_minutes < 0 {
            return Err(PersistenceError::InvalidWindow(window_minutes));
        }

        let since = OffsetDateTime::now_utc()
            .unix_timestamp()
            .saturating_sub(window_minutes.saturating_mul(60));

        let samples = self.fetch_range(device_id, since, i64::MAX).await?;

        Ok(samples
            .into_iter()
            .map(|sample| sample.project(channels))
            .collect())
    }
}
