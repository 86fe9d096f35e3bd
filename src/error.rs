//! Error handling for the merit mining client
//!
//! One error type covers the stratum protocol engine, the miner and the
//! cycle-search collaborators. Transport failures are separated from protocol
//! violations so the receive loop can decide between reconnecting and
//! dropping a single message.

use thiserror::Error;

/// Result type alias for mining operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the mining client
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed hex in a pool message
    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Mining work errors
    #[error("Work error: {message}")]
    Work { message: String },

    /// Target validation errors
    #[error("Invalid target: {message}")]
    Target { message: String },

    /// Stratum session errors (handshake, pool list, session state)
    #[error("Stratum error: {message}")]
    Stratum { message: String },

    /// A single pool message that could not be understood
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Worker errors
    #[error("Worker error: {worker_type}: {message}")]
    Worker { worker_type: String, message: String },

    /// Cycle-search collaborator errors
    #[error("Solver error: {message}")]
    Solver { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Network errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Invalid state errors
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a work error
    pub fn work(message: impl Into<String>) -> Self {
        Self::Work {
            message: message.into(),
        }
    }

    /// Create a target error
    pub fn target(message: impl Into<String>) -> Self {
        Self::Target {
            message: message.into(),
        }
    }

    /// Create a stratum error
    pub fn stratum(message: impl Into<String>) -> Self {
        Self::Stratum {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a worker error
    pub fn worker(worker_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Worker {
            worker_type: worker_type.into(),
            message: message.into(),
        }
    }

    /// Create a solver error
    pub fn solver(message: impl Into<String>) -> Self {
        Self::Solver {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Check if error is retryable
    ///
    /// Retryable errors come from the transport. The stratum receive loop
    /// answers them with a reconnect; everything else only drops the message
    /// that caused it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Network { .. } | Error::Timeout { .. } | Error::InvalidState { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Hex(_) => "hex",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Work { .. } => "work",
            Error::Target { .. } => "target",
            Error::Stratum { .. } => "stratum",
            Error::Protocol { .. } => "protocol",
            Error::Worker { .. } => "worker",
            Error::Solver { .. } => "solver",
            Error::Timeout { .. } => "timeout",
            Error::Network { .. } => "network",
            Error::InvalidState { .. } => "invalid_state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        let io = Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_retryable());
        assert!(Error::network("closed").is_retryable());
        assert!(Error::timeout("recv").is_retryable());
    }

    #[test]
    fn test_protocol_errors_are_not_retryable() {
        assert!(!Error::protocol("bad notify").is_retryable());
        assert!(!Error::work("short prevhash").is_retryable());

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!Error::from(json).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::worker("gpu", "device lost");
        assert_eq!(err.to_string(), "Worker error: gpu: device lost");
        assert_eq!(err.category(), "worker");

        let err = Error::timeout("subscribe");
        assert_eq!(err.to_string(), "Operation timed out: subscribe");
    }
}
