//! Error taxonomy shared by every filesync component.

use thiserror::Error;

/// Failure categories surfaced by stores, connectors, and the index.
///
/// Run bookkeeping stores the `Display` form of these errors as the
/// terminal error text of a failed run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Token missing, expired without a refresh token, or refresh rejected.
    #[error("auth error: {0}")]
    Auth(String),

    /// The remote provider API failed or timed out.
    #[error("remote error: {0}")]
    Remote(String),

    /// Persistence failure in a credential, document, or scope store.
    #[error("store error: {0}")]
    Store(String),

    /// The search index rejected a write, delete, or query.
    #[error("index error: {0}")]
    Index(String),

    /// Text could not be extracted from a downloaded file.
    ///
    /// Callers degrade this to empty text; it never fails a run.
    #[error("extraction error: {0}")]
    Extraction(String),
}

impl SyncError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }
}

/// Result alias used across the core crate.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category() {
        assert_eq!(
            SyncError::auth("no refresh token").to_string(),
            "auth error: no refresh token"
        );
        assert_eq!(
            SyncError::remote("HTTP 503").to_string(),
            "remote error: HTTP 503"
        );
    }
}
