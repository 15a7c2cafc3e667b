use std::env;
use std::path::Path;
use std::time::Duration;

use biosync_api::topic::subscription_pattern;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::repositories::DEFAULT_RECENT_WINDOW_MINUTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logger {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// First topic segment, followed by the device id
    pub namespace: String,
    /// Defaults to every sub-topic of `namespace`
    pub subscription: Option<String>,
    pub channel_capacity: usize,
    pub tls: Option<BrokerTls>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTls {
    pub ca_path: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub url: String,
    pub clean_start: bool,
    pub migration_path: Option<String>,
    /// Upper bound for a single store operation
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingestion {
    pub activity_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub tick_millis: u64,
    pub recent_window_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub logger: Logger,
    pub broker: Broker,
    pub database: Database,
    pub ingestion: Ingestion,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or("development".into());

        let mut settings: Settings = Config::builder()
            .add_source(File::with_name("configs/default"))
            .add_source(File::with_name(&format!("configs/{run_mode}")).required(false))
            .add_source(Environment::with_prefix("BIOSYNC").separator("__"))
            .build()?
            .try_deserialize()?;

        if let Some(migrate) = &settings.database.migration_path {
            if !Path::new(migrate).is_dir() {
                settings.database.migration_path = None;
            }
        }

        Ok(settings)
    }
}

impl Broker {
    pub fn subscription(&self) -> String {
        self.subscription
            .clone()
            .unwrap_or_else(|| subscription_pattern(&self.namespace))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Database {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Ingestion {
    pub fn activity_threshold(&self) -> time::Duration {
        time::Duration::seconds(self.activity_threshold_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

impl Default for Ingestion {
    fn default() -> Self {
        Self {
            activity_threshold_secs: 60,
            sweep_interval_secs: 5,
            tick_millis: 1000,
            recent_window_minutes: DEFAULT_RECENT_WINDOW_MINUTES,
        }
    }
}
