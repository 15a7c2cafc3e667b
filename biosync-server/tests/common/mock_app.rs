use std::sync::Arc;

use time::OffsetDateTime;

use biosync_server::configs::{Database, Ingestion, SchemaManager, Storage};
use biosync_server::repositories::{DeviceStatusRepository, SensorReadingRepository};
use biosync_server::services::{ActivityTracker, IngestionService};

pub struct MockApp {
    pub storage: Arc<Storage>,
    pub tracker: Arc<ActivityTracker>,
    pub statuses: DeviceStatusRepository,
    pub readings: SensorReadingRepository,
    pub ingestion: Arc<IngestionService>,
}

impl MockApp {
    pub async fn new() -> Self {
        let storage = Arc::new(Storage::new(Database {
            url: String::from("sqlite::memory:"),
            clean_start: true,
            migration_path: None,
            timeout_secs: 5,
        }, SchemaManager::default()).await.unwrap());

        let tracker = Arc::new(ActivityTracker::new());
        let statuses = DeviceStatusRepository::new(storage.clone());
        let readings = SensorReadingRepository::new(storage.clone(), "Emotibit");
        let ingestion = Arc::new(IngestionService::new(
            tracker.clone(),
            statuses.clone(),
            readings.clone(),
            "Emotibit",
            Ingestion::default(),
        ));

        Self {
            storage,
            tracker,
            statuses,
            readings,
            ingestion,
        }
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.storage.get_pool())
            .await
            .unwrap()
    }
}

pub fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap()
}
