pub mod ingest;
pub mod observer;
pub mod persistence;
pub mod transport;

pub use biosync_api::ReadingError as DecodeError;
pub use ingest::IngestError;
pub use observer::ObserverError;
pub use persistence::PersistenceError;
pub use transport::TransportError;
