//! FIFO admission gate enforcing a minimum interval between API calls
//!
//! Callers enqueue a one-shot release channel. A single worker task drains the
//! queue in order, sleeping until `min_interval` has passed since the previous
//! admission before releasing the head. The worker is spawned when the first
//! admission arrives at an idle gate and exits once the queue is empty.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::GateError;
use crate::telemetry;

/// Default admission rate.
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 10;

/// Default upper bound on how long a caller waits in the queue.
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(30);

struct QueuedAdmission {
    enqueued_at: Instant,
    release: oneshot::Sender<Result<(), GateError>>,
}

#[derive(Default)]
struct GateState {
    queue: VecDeque<QueuedAdmission>,
    processing: bool,
    last_admitted: Option<Instant>,
}

fn lock(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of the gate for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateStatus {
    pub queue_size: usize,
    /// `None` until the first admission.
    pub since_last_admission: Option<Duration>,
    pub processing: bool,
}

/// A reserved position in the gate's queue.
pub struct AdmissionTicket {
    release: oneshot::Receiver<Result<(), GateError>>,
    enqueued_at: Instant,
    timeout: Duration,
}

impl AdmissionTicket {
    /// Wait for release. Returns the time spent queued.
    pub async fn wait(self) -> Result<Duration, GateError> {
        match tokio::time::timeout(self.timeout, self.release).await {
            Ok(Ok(Ok(()))) => Ok(self.enqueued_at.elapsed()),
            Ok(Ok(Err(e))) => Err(e),
            // Worker went away without answering (runtime shutting down)
            Ok(Err(_)) => Err(GateError::QueueCleared),
            Err(_) => Err(GateError::AdmissionTimeout(self.timeout)),
        }
    }
}

/// Serializes API calls to at most `max_requests_per_second`.
pub struct RateGate {
    min_interval: Duration,
    admission_timeout: Duration,
    state: Arc<Mutex<GateState>>,
}

impl RateGate {
    /// Create a gate. A zero rate is treated as one request per second.
    pub fn new(max_requests_per_second: u32, admission_timeout: Duration) -> Self {
        let rps = max_requests_per_second.max(1);
        Self {
            min_interval: Duration::from_secs(1) / rps,
            admission_timeout,
            state: Arc::new(Mutex::new(GateState::default())),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Join the queue without waiting. Must be called inside a tokio runtime.
    pub fn enqueue(&self) -> AdmissionTicket {
        let (tx, rx) = oneshot::channel();
        let enqueued_at = Instant::now();

        let start_worker = {
            let mut state = lock(&self.state);
            state.queue.push_back(QueuedAdmission {
                enqueued_at,
                release: tx,
            });
            debug!(queue_size = state.queue.len(), "admission queued");
            !std::mem::replace(&mut state.processing, true)
        };

        if start_worker {
            tokio::spawn(drain(Arc::clone(&self.state), self.min_interval));
        }

        AdmissionTicket {
            release: rx,
            enqueued_at,
            timeout: self.admission_timeout,
        }
    }

    /// Wait for permission to send one request.
    pub async fn admit(&self) -> Result<(), GateError> {
        let waited = self.enqueue().wait().await?;
        telemetry::record_admission_wait(waited.as_secs_f64());
        if !waited.is_zero() {
            debug!(waited_ms = waited.as_millis() as u64, "admission delayed");
        }
        Ok(())
    }

    /// Reject every queued admission with `QueueCleared`. Returns how many.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = lock(&self.state).queue.drain(..).collect();
        let count = drained.len();
        for admission in drained {
            let _ = admission.release.send(Err(GateError::QueueCleared));
        }
        info!(cleared = count, "rate gate queue cleared");
        count
    }

    pub fn status(&self) -> GateStatus {
        let state = lock(&self.state);
        GateStatus {
            queue_size: state.queue.len(),
            since_last_admission: state.last_admitted.map(|t| t.elapsed()),
            processing: state.processing,
        }
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS_PER_SECOND, DEFAULT_ADMISSION_TIMEOUT)
    }
}

/// Worker loop: release queued admissions one at a time, spaced by `min_interval`.
async fn drain(state: Arc<Mutex<GateState>>, min_interval: Duration) {
    loop {
        let (head, wait) = {
            let mut guard = lock(&state);
            let Some(head) = guard.queue.pop_front() else {
                guard.processing = false;
                return;
            };
            let wait = guard
                .last_admitted
                .map(|last| min_interval.saturating_sub(last.elapsed()))
                .unwrap_or_default();
            (head, wait)
        };

        if head.release.is_closed() {
            // Caller timed out or gave up; its slot goes to the next in line
            continue;
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let now = Instant::now();
        if head.release.send(Ok(())).is_ok() {
            lock(&state).last_admitted = Some(now);
        } else {
            warn!(
                queued_ms = (now - head.enqueued_at).as_millis() as u64,
                "admission abandoned while waiting for its slot"
            );
        }
    }
}
