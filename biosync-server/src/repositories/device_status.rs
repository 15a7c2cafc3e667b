use std::sync::Arc;

use biosync_api::DeviceStatus;
use time::OffsetDateTime;

use crate::configs::Storage;
use crate::errors::PersistenceError;
use crate::models::DeviceStatusRecord;

/// Outcome of [`DeviceStatusRepository::record_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// A transition: new row with this id
    Inserted(i64),
    /// Same status as the latest row, whose timestamp was moved forward
    Refreshed(i64),
}

impl StatusWrite {
    pub fn id(&self) -> i64 {
        match self {
            StatusWrite::Inserted(id) | StatusWrite::Refreshed(id) => *id,
        }
    }
}

#[derive(Clone)]
pub struct DeviceStatusRepository {
    storage: Arc<Storage>,
}

impl DeviceStatusRepository {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeviceStatusRepository {
    /// Appends a transition, or folds a repeated status into the latest row.
    ///
    /// The latest row is the one with the greatest `timestamp` for the device.
    /// When its status equals `status` only `timestamp`, `datetime` and
    /// `updated_at` change, so the history never holds two consecutive rows
    /// with the same status. Both steps run in one transaction; the update is
    /// issued first so the transaction holds the write lock from the start.
    pub async fn record_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        timestamp: i64,
    ) -> Result<StatusWrite, PersistenceError> {
        let datetime = OffsetDateTime::from_unix_timestamp(timestamp)
            .map_err(|_| PersistenceError::InvalidTimestamp(timestamp))?;
        let now = OffsetDateTime::now_utc();
        let pool = self.storage.get_pool();

        self.storage
            .run(async {
                let mut transaction = pool.begin().await?;

                let refreshed: Option<i64> = sqlx::query_scalar(
                    r#"
                    UPDATE device_status
                    SET timestamp = $1, datetime = $2, updated_at = $3
                    WHERE id = (
                        SELECT id FROM device_status
                        WHERE device_id = $4
                        ORDER BY timestamp DESC, id DESC
                        LIMIT 1
                    ) AND status = $5
                    RETURNING id
                    "#,
                )
                .bind(timestamp)
                .bind(datetime)
                .bind(now)
                .bind(device_id)
                .bind(status.as_str())
                .fetch_optional(&mut *transaction)
                .await?;

                let write = match refreshed {
                    Some(id) => StatusWrite::Refreshed(id),
                    None => {
                        let id = sqlx::query(
                            r#"
                            INSERT INTO device_status (device_id, status, timestamp, datetime, created_at)
                            VALUES ($1, $2, $3, $4, $5)
                            "#,
                        )
                        .bind(device_id)
                        .bind(status.as_str())
                        .bind(timestamp)
                        .bind(datetime)
                        .bind(now)
                        .execute(&mut *transaction)
                        .await?
                        .last_insert_rowid();

                        StatusWrite::Inserted(id)
                    }
                };

                transaction.commit().await?;

                Ok::<_, sqlx::Error>(write)
            })
            .await
    }

    pub async fn find_latest(&self, device_id: &str) -> Result<Option<DeviceStatusRecord>, PersistenceError> {
        self.storage
            .run(
                sqlx::query_as(
                    r#"
                    SELECT * FROM device_status
                    WHERE device_id = $1
                    ORDER BY timestamp DESC, id DESC
                    LIMIT 1
                    "#,
                )
                .bind(device_id)
                .fetch_optional(self.storage.get_pool()),
            )
            .await
    }

    /// Full transition log of a device, oldest first.
    pub async fn find_by_device_id(&self, device_id: &str) -> Result<Vec<DeviceStatusRecord>, PersistenceError> {
        self.storage
            .run(
                sqlx::query_as(
                    r#"
                    SELECT * FROM device_status
                    WHERE device_id = $1
                    ORDER BY timestamp ASC, id ASC
                    "#,
                )
                .bind(device_id)
                .fetch_all(self.storage.get_pool()),
            )
            .await
    }
}
