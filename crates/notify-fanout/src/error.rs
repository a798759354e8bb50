//! Error types for the fan-out core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the fan-out core
#[derive(Error, Debug)]
pub enum Error {
    /// A notification failed validation before publish
    #[error("invalid notification: {0}")]
    Validation(#[from] ValidationError),

    /// A channel name did not match the channel grammar
    #[error("invalid channel: {0}")]
    Channel(#[from] ChannelError),

    /// Publish or subscribe was called without a channel
    #[error("channel name is empty")]
    EmptyChannel,

    /// Message could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every publish attempt failed
    #[error("publish to {channel} failed after {attempts} attempts: {source}")]
    PublishFailed {
        channel: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Broker rejected a subscription change or its confirmation
    #[error("subscription error: {0}")]
    Subscription(#[source] anyhow::Error),

    /// The incoming message stream has already been handed out
    #[error("incoming message stream already taken")]
    StreamTaken,

    /// The dispatcher worker pool is already running
    #[error("dispatcher already started")]
    AlreadyStarted,

    /// Ordered shutdown did not finish in time
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A required notification field is missing or zero
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
}

/// Channel name parse failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {channel:?} does not start with prefix {prefix:?}")]
    MissingPrefix { channel: String, prefix: String },

    #[error("channel {0:?} is outside the notifications namespace")]
    InvalidNamespace(String),

    #[error("unknown channel scope in {0:?}")]
    UnknownScope(String),

    #[error("channel {0:?} has an empty target id")]
    MissingId(String),
}
