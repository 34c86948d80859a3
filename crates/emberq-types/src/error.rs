//! Error types for EmberQ
//!
//! Defines all error types used throughout the broker.

use std::fmt;

use thiserror::Error;

/// Startup stage that failed while bringing the broker up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    /// Queue registry initialization (declared queues)
    Registry,
    /// Transport listener bind
    Listener,
}

impl fmt::Display for StartupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry => write!(f, "registry"),
            Self::Listener => write!(f, "listener"),
        }
    }
}

/// Main error type for EmberQ operations
#[derive(Error, Debug)]
pub enum Error {
    /// Queue name is empty or malformed
    #[error("Invalid queue name: {0:?}")]
    InvalidName(String),

    /// Queue not found
    #[error("Queue not found: {0}")]
    NotFound(String),

    /// Queue still holds messages and deletion was not forced
    #[error("Queue is not empty: {0}")]
    QueueNotEmpty(String),

    /// Queue was deleted or the registry shut down
    #[error("Queue is closed: {0}")]
    QueueClosed(String),

    /// Session (or its connection) has been closed
    #[error("Session is closed")]
    SessionClosed,

    /// Message is not held by the acknowledging consumer
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Listener could not bind its address
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Broker startup failed at the given stage and was rolled back
    #[error("Startup failed at {stage} stage: {source}")]
    Startup {
        stage: StartupStage,
        #[source]
        source: Box<Error>,
    },

    /// Broker is not running
    #[error("Broker is not running")]
    NotRunning,

    /// Broker or listener is already running
    #[error("Already running")]
    AlreadyRunning,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected protocol frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a lower-level failure as a startup failure of `stage`
    pub fn startup(stage: StartupStage, source: Error) -> Self {
        Self::Startup {
            stage,
            source: Box::new(source),
        }
    }
}

/// Result type alias for EmberQ operations
pub type Result<T> = std::result::Result<T, Error>;
