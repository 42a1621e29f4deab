//! Credential acquisition and caching for the brokerage web API
//!
//! The brokerage exposes no login or token endpoint to this client. Credentials
//! are observed passively in the authenticated browser session's own traffic,
//! then cached in two tiers so most calls never wait on the browser.
//!
//! Credential flow:
//! 1. Executor asks `credentials::CredentialStore::get()` for a cached credential
//! 2. On a miss, `acquire::CredentialAcquirer::capture()` watches session traffic
//! 3. A captured credential is written to both tiers via `CredentialStore::set()`
//! 4. A degraded (cookie-only) credential only goes to the in-process slot
//! 5. A 401 from the API calls `CredentialStore::clear()`, forcing step 2 next time

pub mod acquire;
pub mod constants;
pub mod credentials;
pub mod error;

pub use acquire::{AcquiredCredential, AcquisitionPolicy, CredentialAcquirer, CredentialSource};
pub use constants::*;
pub use credentials::{CacheInfo, CachePolicy, Credential, CredentialStore, now_millis};
pub use error::{Error, Result};
