//! Error types for configuration loading and persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Filesystem error reading or writing the document.
    #[error("config IO error at {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The document exists but is not valid JSON for the schema.
    ///
    /// Fatal at startup; the caller may recover by writing the default
    /// document.
    #[error("malformed config at {path}: {source}")]
    Malformed {
        /// The path of the unreadable document.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A time-of-day string was not `HH:MM`.
    #[error("invalid time of day: {value:?} (expected HH:MM)")]
    InvalidTime {
        /// The offending value.
        value: String,
    },

    /// A queue definition violates an invariant.
    #[error("invalid queue {name:?}: {reason}")]
    InvalidQueue {
        /// Queue name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The home directory could not be resolved for the default config path.
    #[error("cannot resolve home directory for config path")]
    NoHome,
}

impl ConfigError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid-queue error.
    pub fn invalid_queue(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueue {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_time_display() {
        let error = ConfigError::InvalidTime {
            value: "25:99".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("25:99"));
        assert!(msg.contains("HH:MM"));
    }

    #[test]
    fn test_invalid_queue_display() {
        let error = ConfigError::invalid_queue("night", "max_concurrent must be at least 1");
        let msg = error.to_string();
        assert!(msg.contains("night"));
        assert!(msg.contains("max_concurrent"));
    }
}
