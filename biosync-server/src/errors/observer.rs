#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("Observer {observer} failed: {message}")]
    Failed {
        observer: &'static str,
        message: String,
    },

    #[error("Observer {0} panicked")]
    Panicked(&'static str),
}

impl ObserverError {
    pub fn failed(observer: &'static str, message: impl Into<String>) -> Self {
        ObserverError::Failed {
            observer,
            message: message.into(),
        }
    }
}
