//! Retry/abort decisions for brokerage API outcomes
//!
//! The brokerage reports business failures two ways: a 400 with validation
//! errors, or a 200 whose body says `isSuccessful: false`. Neither is worth
//! retrying. Only server-side trouble (408, 5xx) and transport failures are.

use crate::error::ErrorKind;

/// What the executor should do with an attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Fail the call now.
    Terminal(ErrorKind),
    /// Back off and try again if budget remains.
    Retry(ErrorKind),
}

/// Classify an attempt by HTTP status and the body's `isSuccessful` flag.
///
/// `status` is `None` when no response was received.
pub fn classify(status: Option<u16>, domain_success: Option<bool>) -> Verdict {
    let Some(status) = status else {
        return Verdict::Retry(ErrorKind::Network);
    };
    match status {
        200 if domain_success == Some(false) => Verdict::Terminal(ErrorKind::DomainRejection),
        200 => Verdict::Success,
        400 => Verdict::Terminal(ErrorKind::Validation),
        401 => Verdict::Terminal(ErrorKind::Auth),
        408 | 500.. => Verdict::Retry(ErrorKind::TransientServer),
        _ => Verdict::Terminal(ErrorKind::Unexpected),
    }
}
