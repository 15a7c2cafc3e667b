use biosync_api::DeviceStatus;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::Table;

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceStatusRecord {
    pub id: i64,
    pub device_id: String,
    #[sqlx(try_from = "String")]
    pub status: DeviceStatus,
    /// Unix seconds of the event that produced or last refreshed this status
    pub timestamp: i64,
    pub datetime: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct DeviceStatusTable;

impl Table for DeviceStatusTable {
    fn name(&self) -> &'static str {
        "device_status"
    }

    fn create(&self) -> String {
        String::from(
            r#"
            CREATE TABLE IF NOT EXISTS device_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id VARCHAR(255) NOT NULL,
                status VARCHAR(16) NOT NULL CHECK (status IN ('active', 'inactive')),
                timestamp INTEGER NOT NULL,
                datetime TIMESTAMP NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_device_status_device_time
                ON device_status (device_id, timestamp DESC);
            "#,
        )
    }

    fn dispose(&self) -> String {
        String::from("DROP TABLE IF EXISTS device_status;")
    }
}
