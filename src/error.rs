//! Error taxonomy for the benchmark harness.
//!
//! Every fatal condition maps to one of three classes: configuration
//! problems caught before any group or device work, resource-budget
//! violations caught before allocation, and transport failures during
//! group setup or collective calls.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("buffer of {requested_bytes} bytes exceeds device capacity of {available_bytes} bytes")]
    Resource {
        requested_bytes: u64,
        available_bytes: u64,
    },

    #[error("transport failure: {reason}")]
    Transport { reason: String },
}

impl BenchError {
    pub fn config(reason: impl Into<String>) -> Self {
        BenchError::Config {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        BenchError::Transport {
            reason: reason.into(),
        }
    }

    /// Error-class name carried on the final fatal log line.
    pub fn kind(&self) -> &'static str {
        match self {
            BenchError::Config { .. } => "ConfigurationError",
            BenchError::Resource { .. } => "ResourceError",
            BenchError::Transport { .. } => "TransportError",
        }
    }
}
