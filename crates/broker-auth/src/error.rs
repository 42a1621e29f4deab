//! Error types for credential operations

/// Errors from credential acquisition and storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential acquisition failed: {0}")]
    Acquisition(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
