use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Broker refused connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),

    #[error("No answer from broker within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Client request rejected: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Service already started")]
    AlreadyStarted,
}
