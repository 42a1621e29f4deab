//! Error types for brokerage API calls

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a logical request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No credential could be captured or synthesized.
    Acquisition,
    /// 400, or a request rejected before it reached the wire.
    Validation,
    /// 401; the credential store is cleared.
    Auth,
    /// 408 or 5xx.
    TransientServer,
    /// No HTTP status: connect, TLS, timeout, or body read failure.
    Network,
    /// 200 with `isSuccessful: false`.
    DomainRejection,
    /// Any other status.
    Unexpected,
    /// Rate gate cleared or admission timed out.
    Admission,
    /// Successful response body did not decode into the requested type.
    Decode,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Acquisition => "acquisition",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::TransientServer => "transient_server",
            ErrorKind::Network => "network",
            ErrorKind::DomainRejection => "domain_rejection",
            ErrorKind::Unexpected => "unexpected",
            ErrorKind::Admission => "admission",
            ErrorKind::Decode => "decode",
        }
    }

    /// Whether the cached credential must be discarded.
    pub fn invalidates_credentials(&self) -> bool {
        matches!(self, ErrorKind::Auth)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of the `omsError` array in an API response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainError {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

/// The single error type every executor call resolves to.
///
/// `status_code` is `None` exactly when no HTTP response was received.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub domain_errors: Vec<DomainError>,
    /// Attempts started before giving up (0 when rejected up front).
    pub attempts: u32,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            domain_errors: Vec::new(),
            attempts: 0,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_domain_errors(mut self, errors: Vec<DomainError>) -> Self {
        self.domain_errors = errors;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Code of the first domain error, if the server sent one.
    pub fn code(&self) -> Option<i64> {
        self.domain_errors.first().and_then(|e| e.code)
    }
}

impl From<broker_auth::Error> for ApiError {
    fn from(e: broker_auth::Error) -> Self {
        ApiError::new(ErrorKind::Acquisition, e.to_string())
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        ApiError::new(ErrorKind::Admission, e.to_string())
    }
}

/// Why the rate gate refused an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("rate gate queue cleared")]
    QueueCleared,

    #[error("admission timed out after {0:?}")]
    AdmissionTimeout(std::time::Duration),
}
