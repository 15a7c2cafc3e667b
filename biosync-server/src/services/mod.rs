pub mod activity_service;
pub mod ingestion_service;
pub mod mqtt_service;

pub use activity_service::*;
pub use ingestion_service::*;
pub use mqtt_service::*;
