//! Header redaction for logging
//!
//! Credential headers are plain strings on the wire and in the cache file, so
//! anything that logs a header map goes through `redact_headers` first.

use std::collections::BTreeMap;

/// Replacement text for masked header values.
pub const MASK: &str = "***MASKED***";

/// Header names whose values carry credentials.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "x-csrf-token"];

/// Whether a header value must never be logged.
pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Copy a header map with credential values replaced by [`MASK`].
pub fn redact_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if is_sensitive_header(name) {
                MASK.to_string()
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}
