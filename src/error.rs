//! WolfElect Error Types

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for WolfElect operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfElect error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Identity errors
    #[error("Node key at {path:?} is corrupted: {reason}")]
    IdentityCorrupt { path: PathBuf, reason: String },

    #[error("Failed to persist node key at {path:?}: {source}")]
    IdentityPersist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Registration errors
    #[error("Registration failed while {stage}: {source}")]
    Registration {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    // Coordination store errors
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Coordination store request timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Coordination store session is closed")]
    StoreClosed,

    // Election errors
    #[error("Membership snapshot is empty (own marker has lapsed)")]
    EmptyMembership,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::Store(_)
                | Error::StoreTimeout(_)
                | Error::EmptyMembership
        )
    }

    /// Wrap a store error with the registration step that produced it
    pub(crate) fn registration(stage: &'static str, source: Error) -> Self {
        Error::Registration {
            stage,
            source: Box::new(source),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::StoreUnavailable(e.to_string())
        } else {
            Error::Store(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::StoreUnavailable("down".into()).is_retryable());
        assert!(Error::StoreTimeout(Duration::from_secs(3)).is_retryable());
        assert!(Error::EmptyMembership.is_retryable());
        assert!(!Error::Config("no data dir".into()).is_retryable());
        assert!(!Error::StoreClosed.is_retryable());
    }

    #[test]
    fn test_registration_error_keeps_source() {
        let err = Error::registration("granting lease", Error::StoreUnavailable("refused".into()));
        assert!(err.to_string().contains("granting lease"));
        assert!(err.source().is_some());
    }
}
