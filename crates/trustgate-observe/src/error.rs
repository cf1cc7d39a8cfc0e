//! Error types for the exchange log and monitoring sinks.

/// Errors that can occur while recording an exchange.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// Writing to the log file failed.
    #[error("exchange log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed.
    #[error("exchange log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
