// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative cancellation primitives for in-flight jobs.

use rcx_core::JobId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Why a job ended up cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// An explicit terminate request from a caller.
    UserRequested,
    /// `cancel_grace` elapsed without the worker observing the request.
    GraceExpired,
    /// The coordinator process is shutting down.
    SystemShutdown,
}

struct JobCancellationState {
    cancelled: AtomicBool,
    notify: Notify,
    reason: Mutex<Option<CancellationReason>>,
    requested_at: Mutex<Option<std::time::Instant>>,
}

/// A cloneable handle on one job's cancellation state and the reason it was
/// first cancelled for.
///
/// All clones share the same underlying state; cancelling one immediately
/// makes every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancellableJob {
    inner: Arc<JobCancellationState>,
}

impl CancellableJob {
    /// Create a fresh, not-yet-cancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JobCancellationState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                reason: Mutex::new(None),
                requested_at: Mutex::new(None),
            }),
        }
    }

    /// Cancel with the given reason. Only the first reason is kept;
    /// subsequent calls still notify waiters but do not overwrite it.
    pub fn cancel(&self, reason: CancellationReason) {
        {
            let mut guard = self.inner.reason.lock().expect("reason lock poisoned");
            if guard.is_none() {
                *guard = Some(reason);
                *self.inner.requested_at.lock().expect("timer lock poisoned") = Some(std::time::Instant::now());
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// `true` once [`CancellableJob::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a future that completes once this job is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }

    /// The recorded cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancellationReason> {
        *self.inner.reason.lock().expect("reason lock poisoned")
    }

    /// Seconds elapsed since cancellation was requested, if it was.
    #[must_use]
    pub fn seconds_since_requested(&self) -> Option<u64> {
        self.inner
            .requested_at
            .lock()
            .expect("timer lock poisoned")
            .map(|t| t.elapsed().as_secs())
    }
}

impl Default for CancellableJob {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellableJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableJob")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Process-wide registry of in-flight jobs' cancellation handles.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    jobs: Mutex<BTreeMap<JobId, CancellableJob>>,
}

impl CancellationRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh handle for `job_id`, replacing any existing one.
    pub fn register(&self, job_id: JobId) -> CancellableJob {
        let handle = CancellableJob::new();
        self.jobs
            .lock()
            .expect("cancellation registry lock poisoned")
            .insert(job_id, handle.clone());
        handle
    }

    /// Signal cancellation for `job_id`, if it is registered.
    ///
    /// Returns `true` if a handle was found and signalled.
    pub fn request_cancel(&self, job_id: JobId, reason: CancellationReason) -> bool {
        let jobs = self.jobs.lock().expect("cancellation registry lock poisoned");
        if let Some(handle) = jobs.get(&job_id) {
            handle.cancel(reason);
            true
        } else {
            false
        }
    }

    /// Remove a job's handle once it has reached a terminal state.
    pub fn forget(&self, job_id: JobId) {
        self.jobs
            .lock()
            .expect("cancellation registry lock poisoned")
            .remove(&job_id);
    }

    /// List job ids whose cancellation has been outstanding for at least
    /// `grace_secs` without the job having been forgotten (i.e. the worker
    /// has not yet observed the checkpoint).
    #[must_use]
    pub fn jobs_past_grace(&self, grace_secs: u64) -> Vec<JobId> {
        self.jobs
            .lock()
            .expect("cancellation registry lock poisoned")
            .iter()
            .filter(|(_, handle)| handle.seconds_since_requested().is_some_and(|s| s >= grace_secs))
            .map(|(id, _)| *id)
            .collect()
    }
}
