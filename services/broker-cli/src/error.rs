//! Command-line value errors

use thiserror::Error;

/// Errors from parsing `brokerctl` option values.
///
/// These surface through clap's value parsers. API failures are reported as
/// JSON on stdout by the `request` command and never pass through this type.
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid header {0:?}, expected NAME:VALUE")]
    InvalidHeader(String),

    #[error("--body is not valid JSON: {0}")]
    InvalidBody(String),
}
