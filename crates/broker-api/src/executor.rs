//! Request execution with credentials, rate limiting, and retries
//!
//! `RequestExecutor` is constructed once with its collaborators and shared via
//! `Arc`. One logical call runs its attempts sequentially; the only ordering
//! between independent calls comes from the rate gate's FIFO queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use broker_auth::{CredentialAcquirer, CredentialSource, CredentialStore};
use common::redact_headers;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::classify::{Verdict, classify};
use crate::error::{ApiError, DomainError, ErrorKind};
use crate::rate_gate::RateGate;
use crate::telemetry;

/// Retry budget and backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt for retryable server errors.
    pub max_retries: u32,
    /// Upper bound on retries after transport failures.
    pub network_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            network_retries: 1,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_cap)
    }

    /// Retries allowed after a retryable failure of this kind, given the call's retry limit.
    fn budget(&self, kind: ErrorKind, max_retries: u32) -> u32 {
        match kind {
            ErrorKind::Network => max_retries.min(self.network_retries),
            _ => max_retries,
        }
    }
}

/// A failed attempt, carrying whether its verdict allows another try.
#[derive(Debug)]
struct AttemptFailure {
    error: ApiError,
    retryable: bool,
}

impl AttemptFailure {
    fn from_verdict(verdict: Verdict, error: impl FnOnce(ErrorKind) -> ApiError) -> Option<Self> {
        match verdict {
            Verdict::Success => None,
            Verdict::Retry(kind) => Some(Self {
                error: error(kind),
                retryable: true,
            }),
            Verdict::Terminal(kind) => Some(Self {
                error: error(kind),
                retryable: false,
            }),
        }
    }
}

/// Admission and acquisition failures are never retried.
impl From<ApiError> for AttemptFailure {
    fn from(error: ApiError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Merged over credential headers; the caller's value wins on conflict.
    pub extra_headers: BTreeMap<String, String>,
    /// Overrides `RetryPolicy::max_retries` for this call.
    pub max_retries: Option<u32>,
    /// Wait for a rate gate admission before every attempt.
    pub rate_limited: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            extra_headers: BTreeMap::new(),
            max_retries: None,
            rate_limited: true,
        }
    }
}

/// Executes brokerage API calls.
pub struct RequestExecutor {
    client: reqwest::Client,
    gate: Arc<RateGate>,
    store: Arc<CredentialStore>,
    acquirer: Arc<CredentialAcquirer>,
    policy: RetryPolicy,
    /// Serializes the store lookup and capture so concurrent misses capture once.
    acquire_lock: tokio::sync::Mutex<()>,
}

impl RequestExecutor {
    pub fn new(
        client: reqwest::Client,
        gate: Arc<RateGate>,
        store: Arc<CredentialStore>,
        acquirer: Arc<CredentialAcquirer>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            gate,
            store,
            acquirer,
            policy,
            acquire_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Credential headers for the next request, capturing from the session on a miss.
    pub async fn auth_headers(&self) -> Result<BTreeMap<String, String>, ApiError> {
        let _guard = self.acquire_lock.lock().await;

        if let Some(credential) = self.store.get().await {
            telemetry::record_credential_lookup("hit");
            return Ok(credential.headers().clone());
        }

        let timeout = self.acquirer.policy().timeout;
        let acquired = match self.acquirer.capture(timeout).await {
            Ok(acquired) => acquired,
            Err(e) => {
                telemetry::record_credential_lookup("failed");
                warn!(error = %e, "credential acquisition failed");
                return Err(e.into());
            }
        };

        let headers = acquired.credential.headers().clone();
        match acquired.source {
            CredentialSource::Captured => {
                telemetry::record_credential_lookup("captured");
                if let Err(e) = self.store.set(acquired.credential).await {
                    warn!(error = %e, "could not persist credential, keeping it in-process");
                }
            }
            CredentialSource::Degraded => {
                telemetry::record_credential_lookup("degraded");
                self.store.remember(acquired.credential).await;
            }
        }
        Ok(headers)
    }

    /// Send one logical request and decode the JSON response into `T`.
    ///
    /// `method` must be GET, POST, PUT, or DELETE (any case). A body that is not
    /// JSON is returned as `{"text": <raw body>}`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        url: &str,
        body: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<T, ApiError> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        self.execute(request_id, method, url, body, options).await
    }

    #[instrument(skip_all, fields(request_id = %request_id, method = %method, url = %url))]
    async fn execute<T: DeserializeOwned>(
        &self,
        request_id: String,
        method: &str,
        url: &str,
        body: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<T, ApiError> {
        let started = Instant::now();
        let label = method.to_ascii_uppercase();

        let Some(http_method) = parse_method(&label) else {
            let err = ApiError::new(
                ErrorKind::Validation,
                format!("unsupported method {method}"),
            );
            warn!("rejected unsupported method");
            telemetry::record_request(&label, err.kind.label(), 0.0);
            return Err(err);
        };

        let max_retries = options.max_retries.unwrap_or(self.policy.max_retries);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let failure = match self
                .attempt(&http_method, url, body, options, attempt)
                .await
            {
                Ok(value) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    return match serde_json::from_value::<T>(value) {
                        Ok(decoded) => {
                            telemetry::record_request(&label, "success", elapsed);
                            Ok(decoded)
                        }
                        Err(e) => {
                            let err = ApiError::new(
                                ErrorKind::Decode,
                                format!("response did not match the expected shape: {e}"),
                            )
                            .with_status(200)
                            .with_attempts(attempt);
                            warn!(error = %e, "response decode failed");
                            telemetry::record_request(&label, err.kind.label(), elapsed);
                            Err(err)
                        }
                    };
                }
                Err(failure) => failure,
            };
            let err = failure.error;

            if err.kind.invalidates_credentials() {
                warn!("credential rejected, clearing cache");
                self.store.clear().await;
            }

            let retries_used = attempt - 1;
            if failure.retryable && retries_used < self.policy.budget(err.kind, max_retries) {
                let delay = self.policy.backoff(attempt);
                warn!(
                    attempt,
                    reason = err.kind.label(),
                    status = err.status_code,
                    delay_ms = delay.as_millis() as u64,
                    "retrying request"
                );
                telemetry::record_retry(err.kind.label());
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(
                attempt,
                kind = err.kind.label(),
                status = err.status_code,
                code = err.code(),
                total_ms = started.elapsed().as_millis() as u64,
                "request failed"
            );
            telemetry::record_request(&label, err.kind.label(), started.elapsed().as_secs_f64());
            return Err(err.with_attempts(attempt));
        }
    }

    /// One attempt: admission, credentials, send, parse, classify.
    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        options: &RequestOptions,
        attempt: u32,
    ) -> Result<Value, AttemptFailure> {
        let attempt_start = Instant::now();
        if options.rate_limited {
            self.gate.admit().await.map_err(ApiError::from)?;
        }

        let mut headers = self.auth_headers().await?;
        merge_headers(&mut headers, &options.extra_headers);
        debug!(attempt, headers = ?redact_headers(&headers), "sending request");

        let mut builder = self
            .client
            .request(method.clone(), url)
            .headers(to_header_map(&headers));
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let send_start = Instant::now();
        let (status, raw) = match send_and_read(builder).await {
            Ok(received) => received,
            Err(e) => {
                let failure = transport_failure(e);
                warn!(
                    attempt,
                    send_ms = send_start.elapsed().as_millis() as u64,
                    total_ms = attempt_start.elapsed().as_millis() as u64,
                    outcome = failure.error.kind.label(),
                    error = %failure.error.message,
                    "attempt finished"
                );
                return Err(failure);
            }
        };
        let send_ms = send_start.elapsed().as_millis() as u64;

        let parse_start = Instant::now();
        let parsed = parse_body(raw);
        let parse_ms = parse_start.elapsed().as_millis() as u64;

        let domain_success = parsed.get("isSuccessful").and_then(Value::as_bool);
        let verdict = classify(Some(status), domain_success);
        info!(
            attempt,
            status,
            send_ms,
            parse_ms,
            total_ms = attempt_start.elapsed().as_millis() as u64,
            outcome = ?verdict,
            "attempt finished"
        );

        match AttemptFailure::from_verdict(verdict, |kind| error_from_body(kind, status, &parsed)) {
            None => Ok(parsed),
            Some(failure) => Err(failure),
        }
    }
}

fn parse_method(method: &str) -> Option<Method> {
    match method {
        "GET" => Some(Method::GET),
        "POST" => Some(Method::POST),
        "PUT" => Some(Method::PUT),
        "DELETE" => Some(Method::DELETE),
        _ => None,
    }
}

/// Overlay `extra` on `headers`, replacing same-named headers in any case.
fn merge_headers(headers: &mut BTreeMap<String, String>, extra: &BTreeMap<String, String>) {
    for (name, value) in extra {
        headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        headers.insert(name.clone(), value.clone());
    }
}

fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(n) => n,
            Err(e) => {
                warn!(header = %name, error = %e, "skipping invalid header name");
                continue;
            }
        };
        let value = match HeaderValue::from_str(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(header = %name, error = %e, "skipping invalid header value");
                continue;
            }
        };
        map.insert(name, value);
    }
    map
}

/// Parse a response body as JSON, wrapping anything else as `{"text": raw}`.
fn parse_body(raw: String) -> Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => serde_json::json!({ "text": raw }),
    }
}

/// Send the request and read the whole body; a failure at either step has no usable status.
async fn send_and_read(builder: reqwest::RequestBuilder) -> reqwest::Result<(u16, String)> {
    let response = builder.send().await?;
    let status = response.status().as_u16();
    Ok((status, response.text().await?))
}

fn transport_failure(e: reqwest::Error) -> AttemptFailure {
    if e.is_builder() {
        return ApiError::new(ErrorKind::Validation, format!("invalid request: {e}")).into();
    }
    let message = format!("transport error: {e}");
    // A missing status never classifies as success.
    AttemptFailure::from_verdict(classify(None, None), |kind| {
        ApiError::new(kind, message.clone())
    })
    .unwrap_or_else(|| ApiError::new(ErrorKind::Network, message).into())
}

fn error_from_body(kind: ErrorKind, status: u16, body: &Value) -> ApiError {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| match kind {
            ErrorKind::DomainRejection => "request rejected by the broker".to_string(),
            ErrorKind::Validation => "request failed validation".to_string(),
            ErrorKind::Auth => "authentication failed".to_string(),
            ErrorKind::TransientServer => format!("server error: {status}"),
            _ => format!("request failed with status {status}"),
        });
    let domain_errors = body
        .get("omsError")
        .and_then(|v| serde_json::from_value::<Vec<DomainError>>(v.clone()).ok())
        .unwrap_or_default();
    ApiError::new(kind, message)
        .with_status(status)
        .with_domain_errors(domain_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_auth::{AcquisitionPolicy, CachePolicy, Credential};
    use serde::Deserialize;
    use session::{BrowserSession, ObservedRequest, RecordedSession, SessionCookie};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const CAPTURE_URL: &str = "https://api-mts.orbis.easytrader.ir/api/v2/portfolio";

    struct Harness {
        executor: RequestExecutor,
        session: Arc<RecordedSession>,
        store: Arc<CredentialStore>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(
            dir.path().join("token-cache.json"),
            CachePolicy::default(),
        ));
        let session = Arc::new(RecordedSession::new("test"));
        let observed: Arc<dyn BrowserSession> = session.clone();
        let acquirer = Arc::new(CredentialAcquirer::new(
            observed,
            AcquisitionPolicy {
                timeout: Duration::from_millis(100),
                ..Default::default()
            },
        ));
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            ..Default::default()
        };
        let executor = RequestExecutor::new(
            reqwest::Client::new(),
            Arc::new(RateGate::new(1000, Duration::from_secs(5))),
            store.clone(),
            acquirer,
            policy,
        );
        Harness {
            executor,
            session,
            store,
            _dir: dir,
        }
    }

    fn live_token(session: &RecordedSession, token: &str) {
        session.record(
            ObservedRequest::new(CAPTURE_URL, "GET")
                .with_header("Authorization", format!("Bearer {token}")),
        );
    }

    fn url(server: &MockServer, p: &str) -> String {
        format!("{}{p}", server.uri())
    }

    async fn send(h: &Harness, m: &str, u: &str) -> Result<Value, ApiError> {
        h.executor
            .request(m, u, None, &RequestOptions::default())
            .await
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn network_budget_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.budget(ErrorKind::TransientServer, 2), 2);
        assert_eq!(policy.budget(ErrorKind::Network, 2), 1);
        assert_eq!(policy.budget(ErrorKind::Network, 0), 0);
    }

    #[test]
    fn only_retry_verdicts_are_retryable() {
        let body = serde_json::json!({});
        let failure = |status, success| {
            AttemptFailure::from_verdict(classify(status, success), |kind| {
                error_from_body(kind, status.unwrap_or(0), &body)
            })
        };

        assert!(failure(Some(200), Some(true)).is_none());
        for (status, success, kind, retryable) in [
            (Some(503), None, ErrorKind::TransientServer, true),
            (Some(408), None, ErrorKind::TransientServer, true),
            (None, None, ErrorKind::Network, true),
            (Some(400), None, ErrorKind::Validation, false),
            (Some(401), None, ErrorKind::Auth, false),
            (Some(404), None, ErrorKind::Unexpected, false),
            (Some(200), Some(false), ErrorKind::DomainRejection, false),
        ] {
            let f = failure(status, success).unwrap();
            assert_eq!(f.error.kind, kind, "status {status:?}");
            assert_eq!(f.retryable, retryable, "status {status:?}");
        }

        let admission: AttemptFailure = ApiError::from(crate::error::GateError::QueueCleared).into();
        assert!(!admission.retryable);
    }

    #[test]
    fn merge_lets_caller_override_in_any_case() {
        let mut headers = BTreeMap::from([
            ("Authorization".to_string(), "Bearer cached".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ]);
        let extra = BTreeMap::from([("authorization".to_string(), "Bearer mine".to_string())]);
        merge_headers(&mut headers, &extra);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["authorization"], "Bearer mine");
        assert!(!headers.contains_key("Authorization"));
    }

    #[tokio::test]
    async fn first_call_captures_and_persists_credential() {
        let h = harness();
        live_token(&h.session, "t1");

        let before = broker_auth::now_millis();
        let headers = h.executor.auth_headers().await.unwrap();
        assert_eq!(headers["Authorization"], "Bearer t1");

        let raw = tokio::fs::read_to_string(h.store.path()).await.unwrap();
        let record: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(record["headers"]["Authorization"], "Bearer t1");
        let expires = record["expiresAt"].as_u64().unwrap();
        let two_hours = 2 * 60 * 60 * 1000;
        assert!(expires >= before + two_hours);
        assert!(expires <= broker_auth::now_millis() + two_hours);
    }

    #[tokio::test]
    async fn degraded_credential_stays_in_process() {
        let h = harness();
        h.session.set_cookies(vec![SessionCookie::new("sid", "9")]);

        let headers = h.executor.auth_headers().await.unwrap();
        assert_eq!(headers["Cookie"], "sid=9");
        assert!(!h.store.path().exists(), "degraded credential must not be persisted");

        // Second lookup hits the in-process slot instead of waiting again
        let start = Instant::now();
        let again = h.executor.auth_headers().await.unwrap();
        assert_eq!(again["Cookie"], "sid=9");
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    struct CountingSession {
        inner: RecordedSession,
        subscriptions: AtomicUsize,
    }

    impl BrowserSession for CountingSession {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn subscribe(
            &self,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<Output = session::Result<session::NetworkSubscription>>
                    + Send
                    + '_,
            >,
        > {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            self.inner.subscribe()
        }

        fn cookies(
            &self,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = session::Result<Vec<SessionCookie>>> + Send + '_>,
        > {
            self.inner.cookies()
        }
    }

    #[tokio::test]
    async fn concurrent_misses_capture_once() {
        let dir = tempfile::tempdir().unwrap();
        let recorded = RecordedSession::new("counting");
        live_token(&recorded, "shared");
        let counting = Arc::new(CountingSession {
            inner: recorded,
            subscriptions: AtomicUsize::new(0),
        });
        let observed: Arc<dyn BrowserSession> = counting.clone();
        let executor = Arc::new(RequestExecutor::new(
            reqwest::Client::new(),
            Arc::new(RateGate::default()),
            Arc::new(CredentialStore::new(
                dir.path().join("cache.json"),
                CachePolicy::default(),
            )),
            Arc::new(CredentialAcquirer::new(observed, AcquisitionPolicy::default())),
            RetryPolicy::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move { executor.auth_headers().await }));
        }
        for handle in handles {
            let headers = handle.await.unwrap().unwrap();
            assert_eq!(headers["Authorization"], "Bearer shared");
        }
        assert_eq!(counting.subscriptions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_returns_parsed_body() {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct OrderResponse {
            is_successful: bool,
            id: String,
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/order"))
            .and(header("Authorization", "Bearer t1"))
            .and(header("Accept-Language", "fa"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"isSuccessful": true, "id": "o-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let body = serde_json::json!({"price": 1000, "quantity": 5});
        let order: OrderResponse = h
            .executor
            .request("post", &url(&server, "/api/v2/order"), Some(&body), &RequestOptions::default())
            .await
            .unwrap();

        assert!(order.is_successful);
        assert_eq!(order.id, "o-1");
        let requests = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["quantity"], 5);
    }

    #[tokio::test]
    async fn sustained_503_is_retried_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let err = send(&h, "GET", &url(&server, "/api/v2/orders"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::TransientServer);
        assert_eq!(err.status_code, Some(503));
        assert_eq!(err.attempts, 3);
        assert!(h.store.get().await.is_some(), "server errors keep the credential");
    }

    #[tokio::test]
    async fn transient_failures_then_success() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        Mock::given(method("GET"))
            .respond_with(move |_: &Request| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(502)
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({"orders": []}))
                }
            })
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let value = send(&h, "GET", &url(&server, "/api/v2/orders")).await.unwrap();

        assert_eq!(value["orders"], serde_json::json!([]));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_limit_is_per_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let options = RequestOptions {
            max_retries: Some(0),
            ..Default::default()
        };
        let err = h
            .executor
            .request::<Value>("GET", &url(&server, "/api/v2/x"), None, &options)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn auth_failure_clears_cache_and_next_call_recaptures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer fresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"isSuccessful": true})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        let stale = BTreeMap::from([("Authorization".to_string(), "Bearer stale".to_string())]);
        h.store
            .set(Credential::new(stale, Duration::from_secs(3600)))
            .await
            .unwrap();
        live_token(&h.session, "fresh");

        let err = send(&h, "GET", &url(&server, "/api/v2/portfolio"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert_eq!(err.status_code, Some(401));
        assert_eq!(err.attempts, 1);
        assert!(h.store.get().await.is_none(), "401 must clear the cache");

        send(&h, "GET", &url(&server, "/api/v2/portfolio"))
            .await
            .unwrap();
        let cached = h.store.get().await.unwrap();
        assert_eq!(cached.authorization(), Some("Bearer fresh"));
    }

    #[tokio::test]
    async fn auth_failure_recaptures_the_rotated_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer new"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"isSuccessful": true})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "old");
        let err = send(&h, "GET", &url(&server, "/api/v2/portfolio"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert!(h.store.get().await.is_none());

        // The browser rotates its token; the stale one stays in the session history.
        live_token(&h.session, "new");
        send(&h, "GET", &url(&server, "/api/v2/portfolio"))
            .await
            .unwrap();
        let cached = h.store.get().await.unwrap();
        assert_eq!(cached.authorization(), Some("Bearer new"));
    }

    #[tokio::test]
    async fn validation_error_carries_domain_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "isSuccessful": false,
                "message": "قیمت نامعتبر",
                "omsError": [{"name": "InvalidPrice", "error": "out of range", "code": 7}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let err = send(&h, "POST", &url(&server, "/api/v2/order"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.status_code, Some(400));
        assert_eq!(err.code(), Some(7));
        assert_eq!(err.message, "قیمت نامعتبر");
        assert_eq!(err.domain_errors[0].name.as_deref(), Some("InvalidPrice"));
    }

    #[tokio::test]
    async fn domain_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "isSuccessful": false,
                "message": "insufficient credit",
                "omsError": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let err = send(&h, "POST", &url(&server, "/api/v2/order"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::DomainRejection);
        assert_eq!(err.status_code, Some(200));
        assert_eq!(err.message, "insufficient credit");
        assert!(err.domain_errors.is_empty());
        assert_eq!(err.code(), None);
    }

    #[tokio::test]
    async fn unexpected_status_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let err = send(&h, "GET", &url(&server, "/api/v2/missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unexpected);
        assert_eq!(err.message, "request failed with status 404");
    }

    #[tokio::test]
    async fn non_json_body_is_wrapped_as_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let value = send(&h, "GET", &url(&server, "/api/v2/ping")).await.unwrap();
        assert_eq!(value, serde_json::json!({"text": "pong"}));
    }

    #[tokio::test]
    async fn undecodable_success_body_is_a_decode_error() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Orders {
            orders: Vec<Value>,
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let err = h
            .executor
            .request::<Orders>("GET", &url(&server, "/api/v2/orders"), None, &RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Decode);
        assert_eq!(err.status_code, Some(200));
    }

    #[tokio::test]
    async fn transport_failure_retries_with_network_budget() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let h = harness();
        live_token(&h.session, "t1");
        let err = send(&h, "GET", &format!("http://127.0.0.1:{port}/api/v2/x"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.status_code, None);
        assert_eq!(err.attempts, 2);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn lines_with(&self, needle: &str) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .filter(|line| line.contains(needle))
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn transport_failure_still_logs_attempt_finished() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::INFO)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let h = harness();
        live_token(&h.session, "t1");
        send(&h, "GET", &format!("http://127.0.0.1:{port}/api/v2/x"))
            .await
            .unwrap_err();

        let events = logs.lines_with("attempt finished");
        assert_eq!(events.len(), 2, "one event per attempt");
        for (i, event) in events.iter().enumerate() {
            let fields = &event["fields"];
            assert_eq!(fields["attempt"], i as u64 + 1);
            assert_eq!(fields["outcome"], "network");
            assert!(fields["send_ms"].is_u64());
            assert!(fields["total_ms"].is_u64());
        }
    }

    #[tokio::test]
    async fn unsupported_method_never_reaches_the_wire() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let err = send(&h, "PATCH", &url(&server, "/api/v2/order"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.status_code, None);
        assert_eq!(err.attempts, 0);
        assert!(!h.store.path().exists(), "no credential work for a rejected call");
    }

    #[tokio::test]
    async fn extra_headers_override_credential_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer override"))
            .and(header("X-Client", "brokerctl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let options = RequestOptions {
            extra_headers: BTreeMap::from([
                ("authorization".to_string(), "Bearer override".to_string()),
                ("X-Client".to_string(), "brokerctl".to_string()),
            ]),
            ..Default::default()
        };
        h.executor
            .request::<Value>("GET", &url(&server, "/api/v2/x"), None, &options)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].headers.get_all("authorization").iter().count(), 1);
    }

    #[tokio::test]
    async fn rate_limit_can_be_skipped_per_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let h = harness();
        live_token(&h.session, "t1");
        let unlimited = RequestOptions {
            rate_limited: false,
            ..Default::default()
        };
        h.executor
            .request::<Value>("GET", &url(&server, "/api/v2/x"), None, &unlimited)
            .await
            .unwrap();
        assert_eq!(h.executor.gate().status().since_last_admission, None);

        send(&h, "GET", &url(&server, "/api/v2/x")).await.unwrap();
        assert!(h.executor.gate().status().since_last_admission.is_some());
    }

    #[tokio::test]
    async fn acquisition_failure_surfaces_without_sending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness();
        let err = send(&h, "GET", &url(&server, "/api/v2/x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Acquisition);
        assert_eq!(err.status_code, None);
        assert_eq!(err.attempts, 1);
    }
}
