use super::{DecodeError, PersistenceError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl IngestError {
    pub fn is_decode(&self) -> bool {
        matches!(self, IngestError::Decode(_))
    }
}
