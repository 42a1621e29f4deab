//! Two-tier credential cache
//!
//! Tier one is an in-process slot; tier two is a JSON file that survives
//! restarts. Writes go to both tiers inside one tokio Mutex section, and the
//! file is replaced with temp-file + rename so readers never see a partial
//! record.
//!
//! The durable file is authoritative while it exists. The in-process slot is
//! only consulted when the file is missing or unreadable, and only for a short
//! TTL, which is also how degraded (cookie-only) credentials are held.

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use common::redact_headers;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_CREDENTIAL_TTL, DEFAULT_MEMORY_TTL, DEFAULT_REFRESH_LOOKAHEAD};
use crate::error::{Error, Result};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The header set proving the caller's identity to the brokerage API.
///
/// Immutable once built; a newer capture replaces it wholesale. Serializes to
/// the durable cache format `{"headers", "timestamp", "expiresAt"}` with both
/// timestamps in unix milliseconds.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    headers: BTreeMap<String, String>,
    #[serde(rename = "timestamp")]
    captured_at: u64,
    expires_at: u64,
}

impl Credential {
    /// Stamp a freshly captured header set, valid for `ttl` from now.
    pub fn new(headers: BTreeMap<String, String>, ttl: Duration) -> Self {
        let now = now_millis();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self::from_parts(headers, now, now.saturating_add(ttl_ms))
    }

    pub fn from_parts(headers: BTreeMap<String, String>, captured_at: u64, expires_at: u64) -> Self {
        Self {
            headers,
            captured_at,
            expires_at,
        }
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn captured_at(&self) -> u64 {
        self.captured_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// The bearer header value, if this credential carries one.
    pub fn authorization(&self) -> Option<&str> {
        self.headers.get("Authorization").map(String::as_str)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Whether `now` is inside the refresh window before expiry.
    pub fn needs_refresh(&self, now: u64, lookahead: Duration) -> bool {
        now >= self.expires_at.saturating_sub(lookahead.as_millis() as u64)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("headers", &redact_headers(&self.headers))
            .field("captured_at", &self.captured_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Lifetimes governing both cache tiers.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Durable record lifetime (default 2h).
    pub ttl: Duration,
    /// Refresh warning window before expiry (default 10min).
    pub refresh_lookahead: Duration,
    /// In-process slot lifetime (default 30min).
    pub memory_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CREDENTIAL_TTL,
            refresh_lookahead: DEFAULT_REFRESH_LOOKAHEAD,
            memory_ttl: DEFAULT_MEMORY_TTL,
        }
    }
}

/// Snapshot of the durable record for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    pub exists: bool,
    pub expires_at: Option<u64>,
    pub valid: bool,
    pub age_ms: Option<u64>,
}

struct MemorySlot {
    credential: Credential,
    stored_at: Instant,
}

/// Two-tier credential cache.
///
/// Construct once at startup and share via `Arc`. The tokio Mutex around the
/// in-process slot is the single-writer section for both tiers.
pub struct CredentialStore {
    path: PathBuf,
    policy: CachePolicy,
    slot: Mutex<Option<MemorySlot>>,
    refresh_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl CredentialStore {
    /// Create a store backed by the given file. Nothing is read until `get()`.
    pub fn new(path: PathBuf, policy: CachePolicy) -> Self {
        debug!(path = %path.display(), ttl_secs = policy.ttl.as_secs(), "credential store created");
        Self {
            path,
            policy,
            slot: Mutex::new(None),
            refresh_timer: StdMutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Return a usable credential, or `None` on a miss.
    ///
    /// An expired durable record is deleted from both tiers. A record inside the
    /// refresh window is still returned; the window is only logged.
    pub async fn get(&self) -> Option<Credential> {
        let mut slot = self.slot.lock().await;
        let now = now_millis();

        match read_record(&self.path).await {
            Ok(Some(credential)) => {
                if credential.is_expired(now) {
                    info!(
                        age_ms = now.saturating_sub(credential.captured_at),
                        "cached credential expired, deleting"
                    );
                    *slot = None;
                    self.cancel_refresh();
                    remove_record(&self.path).await;
                    return None;
                }
                if credential.needs_refresh(now, self.policy.refresh_lookahead) {
                    info!(
                        remaining_ms = credential.expires_at - now,
                        "cached credential inside refresh window"
                    );
                }
                debug!(age_ms = now.saturating_sub(credential.captured_at), "durable cache hit");
                return Some(credential);
            }
            Ok(None) => debug!(path = %self.path.display(), "no durable credential"),
            Err(e) => warn!(error = %e, "durable credential unreadable, treating as miss"),
        }

        let fresh = slot.as_ref().is_some_and(|s| {
            s.stored_at.elapsed() < self.policy.memory_ttl && !s.credential.is_expired(now)
        });
        if fresh {
            debug!("in-process cache hit");
            return slot.as_ref().map(|s| s.credential.clone());
        }
        if slot.take().is_some() {
            debug!("in-process credential aged out");
        }
        None
    }

    /// Write a captured credential to both tiers and re-arm the refresh reminder.
    ///
    /// The in-process slot is updated even if the durable write fails, so the
    /// caller can keep working; the error is returned for logging.
    pub async fn set(&self, credential: Credential) -> Result<()> {
        let mut slot = self.slot.lock().await;
        *slot = Some(MemorySlot {
            credential: credential.clone(),
            stored_at: Instant::now(),
        });
        write_atomic(&self.path, &credential).await?;
        self.arm_refresh(credential.expires_at);
        info!(expires_at = credential.expires_at, "credential cached");
        Ok(())
    }

    /// Hold a credential in the in-process slot only (degraded credentials).
    pub async fn remember(&self, credential: Credential) {
        let mut slot = self.slot.lock().await;
        *slot = Some(MemorySlot {
            credential,
            stored_at: Instant::now(),
        });
        debug!("credential held in-process only");
    }

    /// Delete both tiers and cancel the refresh reminder. Idempotent.
    pub async fn clear(&self) {
        let mut slot = self.slot.lock().await;
        let had_slot = slot.take().is_some();
        self.cancel_refresh();
        let had_file = remove_record(&self.path).await;
        if had_slot || had_file {
            info!("credential cache cleared");
        }
    }

    /// Expiry of the durable record, if one is readable.
    pub async fn expires_at(&self) -> Option<u64> {
        read_record(&self.path)
            .await
            .ok()
            .flatten()
            .map(|c| c.expires_at)
    }

    /// Whether `get()` would currently hit.
    pub async fn is_valid(&self) -> bool {
        self.get().await.is_some()
    }

    /// Describe the durable record without modifying it.
    pub async fn info(&self) -> CacheInfo {
        let exists = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        let record = read_record(&self.path).await.ok().flatten();
        let now = now_millis();
        CacheInfo {
            exists,
            expires_at: record.as_ref().map(|c| c.expires_at),
            valid: record.as_ref().is_some_and(|c| !c.is_expired(now)),
            age_ms: record.as_ref().map(|c| now.saturating_sub(c.captured_at)),
        }
    }

    /// Whether a refresh reminder is currently armed.
    pub fn refresh_pending(&self) -> bool {
        self.timer()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.refresh_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_refresh(&self, expires_at: u64) {
        let mut timer = self.timer();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let refresh_at = expires_at.saturating_sub(self.policy.refresh_lookahead.as_millis() as u64);
        let delay_ms = refresh_at.saturating_sub(now_millis());
        if delay_ms == 0 {
            return;
        }

        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            info!(
                expires_at,
                remaining_ms = expires_at.saturating_sub(now_millis()),
                "credential refresh due, cache will expire soon"
            );
        }));
    }

    fn cancel_refresh(&self) {
        if let Some(handle) = self.timer().take() {
            handle.abort();
        }
    }
}

impl Drop for CredentialStore {
    fn drop(&mut self) {
        self.cancel_refresh();
    }
}

/// Read the durable record. A missing file is `Ok(None)`.
async fn read_record(path: &Path) -> Result<Option<Credential>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading credential cache: {e}"))),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| Error::CredentialParse(format!("parsing credential cache: {e}")))
}

/// Delete the durable record. Returns whether a file was removed.
async fn remove_record(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to delete credential cache");
            false
        }
    }
}

/// Temp file suffix, unique per write within this process.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write the credential record atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. Sets permissions to 0600 since the file holds a bearer token.
async fn write_atomic(path: &Path, credential: &Credential) -> Result<()> {
    let json = serde_json::to_string_pretty(credential)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating credential cache directory: {e}")))?;

    let tmp_path = dir.join(format!(
        ".token-cache.tmp.{}.{}",
        std::process::id(),
        WRITE_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}
