use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use biosync_api::DeviceStatus;
use biosync_api::topic::device_id_from_topic;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::configs::Ingestion;
use crate::errors::{IngestError, ObserverError};
use crate::repositories::{DeviceStatusRepository, SensorReadingRepository};

use super::{ActivityTracker, MessageObserver};

/// Result of one inactivity sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices that went inactive in this sweep, sorted
    pub inactive: Vec<String>,
    /// Devices still active afterwards
    pub active_count: usize,
}

/// Ties inbound messages to device presence and telemetry storage.
pub struct IngestionService {
    tracker: Arc<ActivityTracker>,
    statuses: DeviceStatusRepository,
    readings: SensorReadingRepository,
    namespace: String,
    settings: Ingestion,
    decode_failures: AtomicU64,
    /// Held across a tracker change and the status write it causes
    transitions: Mutex<()>,
}

impl IngestionService {
    pub fn new(
        tracker: Arc<ActivityTracker>,
        statuses: DeviceStatusRepository,
        readings: SensorReadingRepository,
        namespace: impl Into<String>,
        settings: Ingestion,
    ) -> Self {
        Self {
            tracker,
            statuses,
            readings,
            namespace: namespace.into(),
            settings,
            decode_failures: AtomicU64::new(0),
            transitions: Mutex::new(()),
        }
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    /// Number of payloads dropped because they could not be decoded.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Handles one message received at `now`.
    ///
    /// The sending device counts as seen even when its payload turns out to
    /// be malformed. Returns the id of the stored reading.
    pub async fn ingest_at(&self, topic: &str, payload: &str, now: OffsetDateTime) -> Result<i64, IngestError> {
        match device_id_from_topic(topic, &self.namespace) {
            Some(device_id) => {
                let _transition = self.transitions.lock().await;
                if self.tracker.touch(device_id, now).await {
                    tracing::info!("device {device_id} is active");
                    self.record(device_id, DeviceStatus::Active, now).await;
                }
            }
            None => tracing::warn!("no device id in topic {topic}"),
        }

        match self.readings.append(topic, payload, now).await {
            Ok(id) => Ok(id),
            Err(e) => {
                if e.is_decode() {
                    self.decode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("dropping payload on {topic}: {e}");
                } else {
                    tracing::error!("failed to store reading from {topic}: {e}");
                }
                Err(e)
            }
        }
    }

    /// Marks every device silent for longer than the activity threshold as inactive.
    pub async fn sweep_at(&self, now: OffsetDateTime) -> SweepReport {
        let _transition = self.transitions.lock().await;

        let inactive = self
            .tracker
            .sweep(now, self.settings.activity_threshold())
            .await;

        for device_id in &inactive {
            tracing::info!("device {device_id} is inactive");
            self.record(device_id, DeviceStatus::Inactive, now).await;
        }

        SweepReport {
            inactive,
            active_count: self.tracker.active_count().await,
        }
    }

    /// Sweeps on the configured cadence until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let interval = self.settings.sweep_interval();
        let mut last_sweep = Instant::now();

        tracing::info!(
            "inactivity sweep every {}s, threshold {}s",
            self.settings.sweep_interval_secs,
            self.settings.activity_threshold_secs
        );

        loop {
            if last_sweep.elapsed() >= interval {
                let report = self.sweep_at(OffsetDateTime::now_utc()).await;
                tracing::debug!("{} active devices", report.active_count);
                last_sweep = Instant::now();
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.settings.tick()) => {}
            }
        }

        tracing::info!("ingestion stopped");
    }

    async fn record(&self, device_id: &str, status: DeviceStatus, now: OffsetDateTime) -> bool {
        match self
            .statuses
            .record_status(device_id, status, now.unix_timestamp())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("failed to record {status} for {device_id}: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl MessageObserver for IngestionService {
    fn name(&self) -> &'static str {
        "IngestionService"
    }

    async fn on_message(&self, topic: &str, payload: &str) -> Result<(), ObserverError> {
        match self.ingest_at(topic, payload, OffsetDateTime::now_utc()).await {
            Ok(_) => Ok(()),
            // counted and logged by ingest_at
            Err(e) if e.is_decode() => Ok(()),
            Err(e) => Err(ObserverError::failed(self.name(), e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::setup_test_db;

    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    async fn service() -> IngestionService {
        let storage = setup_test_db().await;

        IngestionService::new(
            Arc::new(ActivityTracker::new()),
            DeviceStatusRepository::new(storage.clone()),
            SensorReadingRepository::new(storage, "Emotibit"),
            "Emotibit",
            Ingestion::default(),
        )
    }

    #[tokio::test]
    async fn test_first_message_records_active() {
        let service = service().await;

        service.ingest_at("Emotibit/D1", "{}", at(0)).await.unwrap();
        service.ingest_at("Emotibit/D1", "{}", at(10)).await.unwrap();

        let history = service.statuses.find_by_device_id("D1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DeviceStatus::Active);
        assert_eq!(history[0].timestamp, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_still_touches_device() {
        let service = service().await;

        let result = service.ingest_at("Emotibit/D1", "{not json", at(5)).await;

        assert!(matches!(result, Err(IngestError::Decode(_))));
        assert_eq!(service.decode_failures(), 1);
        assert!(service.tracker().is_active("D1").await);
        assert_eq!(
            service.statuses.find_latest("D1").await.unwrap().unwrap().status,
            DeviceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_sweep_records_inactive() {
        let service = service().await;

        service.ingest_at("Emotibit/D1", "{}", at(0)).await.unwrap();
        service.ingest_at("Emotibit/D2", "{}", at(30)).await.unwrap();

        let report = service.sweep_at(at(61)).await;
        assert_eq!(report.inactive, vec!["D1"]);
        assert_eq!(report.active_count, 1);

        let latest = service.statuses.find_latest("D1").await.unwrap().unwrap();
        assert_eq!(latest.status, DeviceStatus::Inactive);
        assert_eq!(latest.timestamp, 61);
    }

    #[tokio::test]
    async fn test_topic_without_device_is_still_stored() {
        let service = service().await;

        let id = service
            .ingest_at("other/D1", r#"{"device_id": "D7"}"#, at(0))
            .await
            .unwrap();

        assert!(service.readings.find_by_id(id).await.unwrap().is_some());
        assert_eq!(service.tracker().active_count().await, 0);
    }

    #[tokio::test]
    async fn test_observer_reports_store_failures_only() {
        let storage = setup_test_db().await;
        let service = IngestionService::new(
            Arc::new(ActivityTracker::new()),
            DeviceStatusRepository::new(storage.clone()),
            SensorReadingRepository::new(storage.clone(), "Emotibit"),
            "Emotibit",
            Ingestion::default(),
        );

        assert!(service.on_message("Emotibit/D1", "{}").await.is_ok());
        assert!(service.on_message("Emotibit/D1", "[]").await.is_ok());
        assert_eq!(service.decode_failures(), 1);

        storage.close().await;

        assert!(matches!(
            service.on_message("Emotibit/D1", "{}").await,
            Err(ObserverError::Failed { observer: "IngestionService", .. })
        ));
    }

    #[tokio::test]
    async fn test_message_during_sweep_keeps_history_ordered() {
        let service = service().await;

        service.ingest_at("Emotibit/D1", "{}", at(0)).await.unwrap();

        // the sweep yields on its store write while the message arrives
        let (report, stored) = tokio::join!(
            service.sweep_at(at(61)),
            service.ingest_at("Emotibit/D1", "{}", at(61)),
        );
        assert_eq!(report.inactive, vec!["D1"]);
        assert!(stored.is_ok());

        let history: Vec<_> = service
            .statuses
            .find_by_device_id("D1")
            .await
            .unwrap()
            .into_iter()
            .map(|record| (record.status, record.timestamp))
            .collect();

        assert_eq!(
            history,
            vec![
                (DeviceStatus::Active, 0),
                (DeviceStatus::Inactive, 61),
                (DeviceStatus::Active, 61),
            ]
        );
        assert!(service.tracker().is_active("D1").await);
        assert_eq!(
            service.statuses.find_latest("D1").await.unwrap().unwrap().status,
            DeviceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let service = service().await;

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            service.run(tokio::time::sleep(std::time::Duration::from_millis(50))),
        )
        .await
        .unwrap();
    }
}
