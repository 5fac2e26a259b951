use std::fmt;

use crate::sdam::TopologyDescription;
use crate::selection::ReadPreference;

/// Errors surfaced by every layer of the driver.
///
/// Variants map onto the error kinds the core subsystems can produce; network
/// and command errors additionally carry the server-reported error labels so
/// the executor can decide whether to retry without re-parsing the reply.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid BSON: {0}")]
    InvalidBson(#[from] crate::bson::de::DecodeError),

    #[error("server selection timed out after {elapsed_ms}ms selecting for {preference:?}")]
    ServerSelection {
        topology: Box<TopologyDescription>,
        preference: ReadPreference,
        elapsed_ms: u64,
    },

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("command failed ({code_name}, {code}): {message}")]
    Command {
        code: i32,
        code_name: String,
        message: String,
        error_labels: Vec<String>,
    },

    #[error("write concern error: {message}")]
    WriteConcern {
        code: i32,
        message: String,
        error_labels: Vec<String>,
    },

    #[error("bulk write error: {0} write errors")]
    BulkWrite(Vec<BulkWriteErrorEntry>),

    #[error("session is inactive and cannot be used for further operations")]
    SessionInactive,

    #[error("session is already in use by another operation")]
    SessionInUse,

    #[error("session belongs to a different client")]
    SessionWrongClient,

    #[error("incompatible server: {0}")]
    Incompatible(String),

    #[error("retry exhausted: {0}")]
    RetryExhausted(Box<Error>),

    #[error("DNS/SRV resolution failed: {0}")]
    Dns(String),
}

#[derive(Debug, Clone)]
pub struct BulkWriteErrorEntry {
    pub index: usize,
    pub code: i32,
    pub message: String,
}

impl fmt::Display for BulkWriteErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ({}) {}", self.index, self.code, self.message)
    }
}

impl Error {
    /// Error labels attached by the server (or synthesized locally for
    /// network errors), used by the executor's retry decision.
    pub fn error_labels(&self) -> &[String] {
        match self {
            Error::Command { error_labels, .. } => error_labels,
            Error::WriteConcern { error_labels, .. } => error_labels,
            _ => &[],
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.error_labels().iter().any(|l| l == label)
    }

    pub fn is_retryable_write(&self) -> bool {
        self.has_label("RetryableWriteError") || matches!(self, Error::Network(_))
    }

    pub fn is_retryable_read(&self) -> bool {
        self.has_label("RetryableReadError") || matches!(self, Error::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
