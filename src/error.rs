//! Error types for distributed training.
//!
//! All fallible operations in this crate return [`Result`]. Only
//! [`TrainError::DataLoss`] is recoverable: the training driver reacts to it
//! by restoring the latest checkpoint and replaying iterations. Every other
//! kind aborts training and propagates to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Error raised while setting up or driving distributed training.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Invalid or conflicting configuration. Raised before training starts.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The requested operation is not supported by the distributed learner.
    #[error("unsupported operation: {message}")]
    Unsupported { message: String },

    /// The transport failed (worker unreachable, send/receive failure).
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A worker lost its state mid-phase or mid-shard. Recoverable by
    /// restoring the last checkpoint and replaying from there.
    #[error("data loss: {message}")]
    DataLoss { message: String },

    /// A reply variant did not match the request that was sent.
    #[error("protocol error: expected {expected} reply, got {got}")]
    Protocol {
        expected: &'static str,
        got: &'static str,
    },

    /// Filesystem failure in the work directory or dataset cache.
    #[error("io error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Binary or JSON encoding/decoding failure.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

pub type Result<T> = std::result::Result<T, TrainError>;

impl TrainError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn data_loss(message: impl Into<String>) -> Self {
        Self::DataLoss {
            message: message.into(),
        }
    }

    pub fn protocol(expected: &'static str, got: &'static str) -> Self {
        Self::Protocol { expected, got }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether this error is the recoverable data-loss signal.
    pub fn is_data_loss(&self) -> bool {
        matches!(self, Self::DataLoss { .. })
    }
}

impl From<postcard::Error> for TrainError {
    fn from(err: postcard::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_loss_is_recoverable() {
        assert!(TrainError::data_loss("worker 2 restarted").is_data_loss());
        assert!(!TrainError::config("bad").is_data_loss());
        assert!(!TrainError::protocol("FindSplits", "EndIter").is_data_loss());
    }

    #[test]
    fn error_messages() {
        let err = TrainError::protocol("StartNewIter", "EndIter");
        assert_eq!(
            err.to_string(),
            "protocol error: expected StartNewIter reply, got EndIter"
        );
    }
}
