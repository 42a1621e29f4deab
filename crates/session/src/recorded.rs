//! Recorded session: an in-memory `BrowserSession` fed from outside.
//!
//! Browser automation pushes every request it sees via `record()`, or exports a
//! snapshot file that `load()` replays. New subscribers first receive the
//! recorded history newest-first, then live traffic, so a capture started
//! after the page already made its API calls sees the most recent token, not
//! one the page has since rotated away.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{BrowserSession, Error, NetworkSubscription, ObservedRequest, Result, SessionCookie};

/// Recorded requests kept for replay; older ones are dropped first.
pub const MAX_HISTORY: usize = 256;

/// On-disk export of a browser session: observed requests plus the cookie jar.
#[derive(Debug, Default, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub requests: Vec<ObservedRequest>,
    #[serde(default)]
    pub cookies: Vec<SessionCookie>,
}

#[derive(Default)]
struct Inner {
    history: VecDeque<ObservedRequest>,
    cookies: Vec<SessionCookie>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<ObservedRequest>>,
    next_subscriber: u64,
}

/// Session backed by recorded traffic.
pub struct RecordedSession {
    id: String,
    inner: Arc<Mutex<Inner>>,
}

impl Inner {
    fn push_history(&mut self, request: ObservedRequest) {
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(request);
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordedSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn from_snapshot(id: impl Into<String>, snapshot: SessionSnapshot) -> Self {
        let session = Self::new(id);
        {
            let mut inner = lock(&session.inner);
            for request in snapshot.requests {
                inner.push_history(request);
            }
            inner.cookies = snapshot.cookies;
        }
        session
    }

    /// Load a snapshot file exported by the browser automation.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Snapshot(format!("reading {}: {e}", path.display())))?;
        let snapshot: SessionSnapshot = serde_json::from_str(&contents)
            .map_err(|e| Error::Snapshot(format!("parsing {}: {e}", path.display())))?;
        info!(
            path = %path.display(),
            requests = snapshot.requests.len(),
            cookies = snapshot.cookies.len(),
            "loaded session snapshot"
        );
        Ok(Self::from_snapshot(path.display().to_string(), snapshot))
    }

    /// Record an observed request and deliver it to live subscribers.
    pub fn record(&self, request: ObservedRequest) {
        let mut inner = lock(&self.inner);
        inner
            .subscribers
            .retain(|_, tx| tx.send(request.clone()).is_ok());
        inner.push_history(request);
    }

    /// Replace the cookie jar.
    pub fn set_cookies(&self, cookies: Vec<SessionCookie>) {
        lock(&self.inner).cookies = cookies;
    }

    /// Forget recorded history (e.g. after the page navigated or re-logged in).
    pub fn reset(&self) {
        lock(&self.inner).history.clear();
    }

    /// Number of installed observers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

impl BrowserSession for RecordedSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self) -> Pin<Box<dyn Future<Output = Result<NetworkSubscription>> + Send + '_>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = {
                let mut inner = lock(&self.inner);
                for request in inner.history.iter().rev() {
                    // Receiver is alive in this scope
                    let _ = tx.send(request.clone());
                }
                let id = inner.next_subscriber;
                inner.next_subscriber += 1;
                inner.subscribers.insert(id, tx);
                id
            };
            debug!(session = %self.id, subscriber = id, "network observer installed");

            let registry = Arc::clone(&self.inner);
            Ok(NetworkSubscription::new(rx, move || {
                lock(&registry).subscribers.remove(&id);
                debug!(subscriber = id, "network observer removed");
            }))
        })
    }

    fn cookies(&self) -> Pin<Box<dyn Future<Output = Result<Vec<SessionCookie>>> + Send + '_>> {
        Box::pin(async move { Ok(lock(&self.inner).cookies.clone()) })
    }
}
