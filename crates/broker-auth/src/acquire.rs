//! Passive credential capture from browser session traffic
//!
//! Installs a network observer on the session and waits for the first request
//! the web app itself sends to the brokerage API with an authorization header.
//! That request's headers are normalized into a credential. If nothing
//! qualifying shows up in time, a degraded credential is built from the cookie
//! jar instead; it is usable but unverified, so it is never durably cached.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use session::{BrowserSession, ObservedRequest, cookie_header};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{
    ACCEPT_JSON, ACCEPT_LANGUAGE, CONTENT_TYPE_JSON, DEFAULT_API_HOST, DEFAULT_API_PATH_MARKER,
    DEFAULT_CAPTURE_TIMEOUT, DEFAULT_CREDENTIAL_TTL, DEFAULT_MEMORY_TTL, DEFAULT_ORIGIN,
};
use crate::credentials::Credential;
use crate::error::{Error, Result};

/// Where a credential came from, which decides how it may be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Copied from a live authenticated request.
    Captured,
    /// Synthesized from cookies after capture timed out.
    Degraded,
}

/// Result of a capture attempt.
#[derive(Debug, Clone)]
pub struct AcquiredCredential {
    pub credential: Credential,
    pub source: CredentialSource,
}

/// What counts as a qualifying request, and how long credentials live.
#[derive(Debug, Clone)]
pub struct AcquisitionPolicy {
    pub api_host: String,
    pub path_marker: String,
    /// Trading site origin, sent as `Origin` and `Referer`.
    pub origin: String,
    /// Default wait used by `RequestExecutor`.
    pub timeout: Duration,
    pub credential_ttl: Duration,
    pub degraded_ttl: Duration,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_API_HOST.to_string(),
            path_marker: DEFAULT_API_PATH_MARKER.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            timeout: DEFAULT_CAPTURE_TIMEOUT,
            credential_ttl: DEFAULT_CREDENTIAL_TTL,
            degraded_ttl: DEFAULT_MEMORY_TTL,
        }
    }
}

/// Captures credentials from an authenticated browser session.
pub struct CredentialAcquirer {
    session: Arc<dyn BrowserSession>,
    policy: AcquisitionPolicy,
}

impl CredentialAcquirer {
    pub fn new(session: Arc<dyn BrowserSession>, policy: AcquisitionPolicy) -> Self {
        Self { session, policy }
    }

    pub fn policy(&self) -> &AcquisitionPolicy {
        &self.policy
    }

    /// Whether an observed request proves an authenticated API session.
    pub fn qualifies(&self, request: &ObservedRequest) -> bool {
        if request.method.eq_ignore_ascii_case("OPTIONS") {
            return false;
        }
        let Ok(url) = Url::parse(&request.url) else {
            return false;
        };
        let host_matches = url
            .host_str()
            .is_some_and(|h| h.eq_ignore_ascii_case(&self.policy.api_host));
        host_matches
            && url.path().contains(&self.policy.path_marker)
            && request
                .header("authorization")
                .is_some_and(|v| !v.trim().is_empty())
    }

    /// Wait up to `timeout` for a qualifying request and build a credential.
    ///
    /// Falls back to a degraded cookie credential on timeout. Fails only when
    /// the cookie jar is empty or unreadable as well.
    pub async fn capture(&self, timeout: Duration) -> Result<AcquiredCredential> {
        let started = Instant::now();
        let mut subscription = match self.session.subscribe().await {
            Ok(s) => s,
            Err(e) => {
                warn!(session = self.session.id(), error = %e, "could not observe session traffic");
                return self.degraded().await;
            }
        };

        let observed = tokio::time::timeout(timeout, async {
            while let Some(request) = subscription.next().await {
                if self.qualifies(&request) {
                    return Some(request);
                }
                debug!(url = %request.url, method = %request.method, "ignoring non-qualifying request");
            }
            None
        })
        .await;
        drop(subscription);

        match observed {
            Ok(Some(request)) => {
                let headers = self.normalize(&request).await;
                info!(
                    url = %request.url,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "credential captured from session traffic"
                );
                Ok(AcquiredCredential {
                    credential: Credential::new(headers, self.policy.credential_ttl),
                    source: CredentialSource::Captured,
                })
            }
            Ok(None) => {
                warn!("session stopped publishing before a qualifying request");
                self.degraded().await
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "no qualifying request observed, falling back to session cookies"
                );
                self.degraded().await
            }
        }
    }

    fn base_headers(&self) -> BTreeMap<String, String> {
        let origin = self.policy.origin.trim_end_matches('/');
        BTreeMap::from([
            ("Content-Type".to_string(), CONTENT_TYPE_JSON.to_string()),
            ("Accept".to_string(), ACCEPT_JSON.to_string()),
            ("Accept-Language".to_string(), ACCEPT_LANGUAGE.to_string()),
            ("Referer".to_string(), format!("{origin}/")),
            ("Origin".to_string(), origin.to_string()),
        ])
    }

    async fn session_cookie_header(&self) -> Option<String> {
        match self.session.cookies().await {
            Ok(jar) => cookie_header(&jar),
            Err(e) => {
                warn!(error = %e, "cookie jar unavailable");
                None
            }
        }
    }

    /// Build the normalized header set from a captured request.
    async fn normalize(&self, request: &ObservedRequest) -> BTreeMap<String, String> {
        let mut headers = self.base_headers();

        let bearer = request
            .headers
            .get("Authorization")
            .or_else(|| request.headers.get("authorization"));
        match bearer {
            Some(token) => {
                headers.insert("Authorization".to_string(), token.clone());
            }
            None => {
                warn!("captured request has no usable Authorization header, reconstructing cookies");
                if let Some(cookies) = self.session_cookie_header().await {
                    headers.insert("Cookie".to_string(), cookies);
                }
            }
        }

        if let Some(v) = request.header("x-requested-with") {
            headers.insert("X-Requested-With".to_string(), v.to_string());
        }
        if let Some(v) = request.header("x-csrf-token") {
            headers.insert("X-CSRF-Token".to_string(), v.to_string());
        }
        if !headers.contains_key("Cookie")
            && let Some(v) = request.header("cookie")
        {
            headers.insert("Cookie".to_string(), v.to_string());
        }

        headers
    }

    async fn degraded(&self) -> Result<AcquiredCredential> {
        let cookies = self.session_cookie_header().await.ok_or_else(|| {
            Error::Acquisition("no qualifying session traffic and no session cookies".into())
        })?;

        let mut headers = self.base_headers();
        headers.insert("Cookie".to_string(), cookies);
        info!("using degraded cookie credential");
        Ok(AcquiredCredential {
            credential: Credential::new(headers, self.policy.degraded_ttl),
            source: CredentialSource::Degraded,
        })
    }
}
