//! Error types for configuration access and snapshot loading.

use chrono::{DateTime, Utc};
use trustgate_types::IdentifierError;

/// Errors that can occur when querying or loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    /// The federation configuration has expired.
    #[error("global configuration is outdated (valid until {valid_until})")]
    Outdated {
        /// End of the validity window.
        valid_until: DateTime<Utc>,
    },

    /// Failed to read a snapshot or key file.
    #[error("failed to read {path}: {source}")]
    FileRead {
        /// Path of the unreadable file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the snapshot file.
    #[error("failed to parse configuration snapshot: {0}")]
    Parse(#[from] toml::de::Error),

    /// An identifier in the snapshot is malformed.
    #[error("invalid identifier in configuration: {0}")]
    Identifier(#[from] IdentifierError),

    /// Key material is missing or malformed.
    #[error("invalid key material: {0}")]
    Key(String),
}

impl ConfError {
    pub(crate) fn file(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            source,
        }
    }
}
