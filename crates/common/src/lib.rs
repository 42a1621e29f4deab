//! Common types shared by the brokerage API workspace

mod error;
mod redact;
mod secret;

pub use error::{Error, Result};
pub use redact::{MASK, is_sensitive_header, redact_headers};
pub use secret::Secret;
