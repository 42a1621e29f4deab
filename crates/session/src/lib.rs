//! Browser session observation seam
//!
//! The brokerage never hands this client a token; the only reliable source of
//! one is traffic that the authenticated browser session generates itself. This
//! crate defines the narrow interface the credential layer needs from that
//! session: watch outbound requests, and read the cookie jar.
//!
//! Browser automation lives outside this workspace. It implements
//! `BrowserSession` directly, or feeds a `RecordedSession` (live `record()` calls
//! or an exported snapshot file).

pub mod recorded;

pub use recorded::{MAX_HISTORY, RecordedSession, SessionSnapshot};

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use common::{Secret, redact_headers};
use serde::Deserialize;
use tokio::sync::mpsc;

/// An outbound request seen on the browser session's network.
#[derive(Clone, Deserialize)]
pub struct ObservedRequest {
    pub url: String,
    pub method: String,
    /// Header names as the browser reported them (case preserved).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ObservedRequest {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for ObservedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedRequest")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &redact_headers(&self.headers))
            .finish()
    }
}

/// A cookie from the browser session's jar.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: Secret<String>,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Secret::new(value.into()),
        }
    }
}

/// Join a cookie jar into a `Cookie` header value (`a=1; b=2`).
///
/// Returns `None` for an empty jar.
pub fn cookie_header(cookies: &[SessionCookie]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    let joined = cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value.expose()))
        .collect::<Vec<_>>()
        .join("; ");
    Some(joined)
}

/// Live view of the session's outbound requests.
///
/// The teardown hook runs exactly once, when the subscription is dropped, so
/// the observer is uninstalled even if the caller is cancelled.
pub struct NetworkSubscription {
    rx: mpsc::UnboundedReceiver<ObservedRequest>,
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl NetworkSubscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<ObservedRequest>,
        teardown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Next observed request, or `None` once the session stops publishing.
    pub async fn next(&mut self) -> Option<ObservedRequest> {
        self.rx.recv().await
    }
}

impl Drop for NetworkSubscription {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session closed: {0}")]
    Closed(String),

    #[error("cookie jar unavailable: {0}")]
    Cookies(String),

    #[error("session snapshot error: {0}")]
    Snapshot(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An authenticated browser session the credential layer can observe.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn BrowserSession>`).
pub trait BrowserSession: Send + Sync {
    /// Identifier for logging (e.g. "recorded", "chromium-cdp").
    fn id(&self) -> &str;

    /// Install a network observer. Dropping the returned subscription removes it.
    fn subscribe(&self) -> Pin<Box<dyn Future<Output = Result<NetworkSubscription>> + Send + '_>>;

    /// Snapshot of the session's cookie jar.
    fn cookies(&self) -> Pin<Box<dyn Future<Output = Result<Vec<SessionCookie>>> + Send + '_>>;
}
