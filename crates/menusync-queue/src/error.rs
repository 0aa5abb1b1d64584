use thiserror::Error;

/// Errors from broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,

    #[error("queue not declared: {0}")]
    QueueNotDeclared(String),

    #[error("queue {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    pub fn transport(msg: impl Into<String>) -> Self {
        BrokerError::Transport(msg.into())
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolClosed => BrokerError::Closed,
            other => BrokerError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}
