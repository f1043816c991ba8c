//! Error types for switchboard

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for switchboard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for switchboard
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied arguments that can never succeed
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A recipient answered, but not with something usable
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// No answer arrived in time; the outcome is unknown
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Transport-level failure (channel setup, delivery)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Trace store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error was raised before any network activity
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}

#[cfg(feature = "storage")]
impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Category of a known remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The reply parsed but carried no text
    EmptyReply,
    /// The reply had a shape we do not understand
    MalformedReply,
    /// The recipient explicitly refused or failed the request
    RemoteRejected,
    /// The request never reached the recipient, or the reply never got back
    TransportFailure,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::EmptyReply => "empty reply",
            Self::MalformedReply => "malformed reply",
            Self::RemoteRejected => "rejected",
            Self::TransportFailure => "transport failure",
        };
        f.write_str(label)
    }
}

/// A known-failed answer from one recipient
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct RemoteError {
    /// Failure category
    pub kind: RemoteErrorKind,
    /// Remote-supplied or locally observed reason
    pub detail: String,
}

impl RemoteError {
    /// Create a new remote error
    pub fn new(kind: RemoteErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Reply carried no extractable text
    pub fn empty_reply(detail: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::EmptyReply, detail)
    }

    /// Reply shape was not recognized
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::MalformedReply, detail)
    }

    /// Recipient rejected the request
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::RemoteRejected, detail)
    }

    /// Transport could not complete the exchange
    pub fn transport_failure(detail: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::TransportFailure, detail)
    }
}
