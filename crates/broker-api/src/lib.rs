//! Resilient request execution against the brokerage web API
//!
//! Every call goes through the same pipeline: wait for a `RateGate` admission,
//! attach cached or freshly captured credentials, send, then let `classify`
//! decide whether the outcome is success, a terminal error, or worth another
//! attempt with exponential backoff.
//!
//! Request lifecycle:
//! 1. `RateGate::admit()` releases callers FIFO, at most N per second
//! 2. `RequestExecutor::auth_headers()` reads the store or captures from the session
//! 3. The response status and `isSuccessful` flag are classified
//! 4. 401 clears the credential store; 408/5xx and transport errors back off and retry
//! 5. Everything else surfaces as a single `ApiError` with its `ErrorKind`

pub mod classify;
pub mod error;
pub mod executor;
pub mod rate_gate;
pub mod telemetry;

pub use classify::{Verdict, classify};
pub use error::{ApiError, DomainError, ErrorKind, GateError};
pub use executor::{RequestExecutor, RequestOptions, RetryPolicy};
pub use rate_gate::{AdmissionTicket, GateStatus, RateGate};
