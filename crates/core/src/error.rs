use thiserror::Error;

/// The universal error type for the Haven engine.
#[derive(Error, Debug)]
pub enum HavenError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Haven operations.
pub type Result<T> = std::result::Result<T, HavenError>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Topic closed")]
    TopicClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
