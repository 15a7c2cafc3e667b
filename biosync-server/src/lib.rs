use std::sync::Arc;

use anyhow::Context;

use crate::configs::{SchemaManager, Settings, Storage};
use crate::repositories::{DeviceStatusRepository, SensorReadingRepository};
use crate::services::{ActivityTracker, IngestionService, MqttService};

pub mod configs;
pub mod errors;
pub mod models;
pub mod repositories;
pub mod services;

pub async fn run(settings: &Arc<Settings>) -> anyhow::Result<()> {
    let storage = Arc::new(
        Storage::new(settings.database.clone(), SchemaManager::default())
            .await
            .context("failed to open the telemetry store")?,
    );

    let namespace = settings.broker.namespace.clone();
    let ingestion = Arc::new(IngestionService::new(
        Arc::new(ActivityTracker::new()),
        DeviceStatusRepository::new(storage.clone()),
        SensorReadingRepository::new(storage.clone(), namespace.clone())
            .with_recent_window(settings.ingestion.recent_window_minutes),
        namespace,
        settings.ingestion.clone(),
    ));

    let mut mqtt = MqttService::new(settings.broker.clone());

    if let Err(e) = mqtt.connect().await {
        storage.close().await;
        return Err(e).context("failed to connect to the MQTT broker");
    }

    mqtt.subscribe(&settings.broker.subscription()).await?;
    mqtt.register_observer(ingestion.clone()).await;
    mqtt.start()?;

    ingestion
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
            tracing::info!("shutting down");
        })
        .await;

    mqtt.stop().await;
    storage.close().await;

    Ok(())
}

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;

    use crate::configs::{Database, SchemaManager, Storage};

    pub async fn setup_test_db() -> Arc<Storage> {
        Arc::new(
            Storage::new(
                Database {
                    url: String::from("sqlite::memory:"),
                    clean_start: true,
                    migration_path: None,
                    timeout_secs: 5,
                },
                SchemaManager::default(),
            )
            .await
            .unwrap(),
        )
    }
}
