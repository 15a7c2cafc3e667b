mod schema;
mod settings;
mod storage;

pub use schema::SchemaManager;
pub use settings::{Broker, BrokerTls, Database, Ingestion, Logger, Settings};
pub use storage::Storage;
