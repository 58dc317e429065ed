//! One long-running operation published at `/org/storaged/jobs/<n>`.
//!
//! A job reaches its terminal state exactly once. Cancellation is
//! cooperative: it flips a flag and fires a token the executor selects on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use storaged_core::{JobId, ObjectPath, Uid};

/// Samples kept for the completion-time estimate.
const MAX_SAMPLES: usize = 100;

pub const CANCELLED_MESSAGE: &str = "Operation was cancelled";

/// Cancellation state shared by a job and its executor.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    requested: Arc<AtomicBool>,
    token: CancellationToken,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// Flag that also trips when `token` is cancelled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            token,
        }
    }

    /// Request cancellation. Returns false if it was already requested.
    pub fn cancel(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Process,
    Thread,
}

/// Terminal state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub message: String,
}

impl JobOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::failure(CANCELLED_MESSAGE)
    }
}

#[derive(Debug, Default)]
struct Progress {
    value: Option<f64>,
    samples: VecDeque<(Instant, f64)>,
    expected_end: Option<DateTime<Utc>>,
}

impl Progress {
    fn record(&mut self, value: f64, at: Instant) {
        let value = value.clamp(0.0, 1.0);
        self.value = Some(value);
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((at, value));
        self.expected_end = self
            .estimate_remaining(value)
            .and_then(|left| chrono::Duration::from_std(left).ok())
            .and_then(|left| Utc::now().checked_add_signed(left));
    }

    /// Mean rate over consecutive samples, extrapolated to completion.
    /// `None` when there is no rate yet or the estimate is not representable.
    fn estimate_remaining(&self, value: f64) -> Option<Duration> {
        let mut rates = Vec::new();
        for (a, b) in self.samples.iter().zip(self.samples.iter().skip(1)) {
            let dt = b.0.duration_since(a.0).as_secs_f64();
            if dt > 0.0 && b.1 > a.1 {
                rates.push((b.1 - a.1) / dt);
            }
        }
        if rates.is_empty() {
            return None;
        }
        let rate = rates.iter().sum::<f64>() / rates.len() as f64;
        Duration::try_from_secs_f64((1.0 - value) / rate).ok()
    }
}

/// Serializable view of a job, as listed by `Manager.GetJobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub path: ObjectPath,
    pub operation: String,
    pub started_by_uid: Uid,
    pub strategy: Strategy,
    pub cancelable: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub objects: Vec<ObjectPath>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expected_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pid: Option<u32>,
}

#[derive(Debug)]
pub struct Job {
    id: JobId,
    path: ObjectPath,
    operation: String,
    started_by: Uid,
    strategy: Strategy,
    objects: Vec<ObjectPath>,
    started_at: DateTime<Utc>,
    cancel: CancelFlag,
    pid: AtomicU32,
    progress: Mutex<Progress>,
    outcome: watch::Sender<Option<JobOutcome>>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        path: ObjectPath,
        operation: String,
        started_by: Uid,
        strategy: Strategy,
        objects: Vec<ObjectPath>,
        cancel: CancelFlag,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            path,
            operation,
            started_by,
            strategy,
            objects,
            started_at: Utc::now(),
            cancel,
            pid: AtomicU32::new(0),
            progress: Mutex::new(Progress::default()),
            outcome,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn started_by(&self) -> Uid {
        self.started_by
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Child process id while a process-backed job is running.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    /// Record the terminal state. Returns false, and changes nothing, if the
    /// job already finished.
    pub(crate) fn complete(&self, outcome: JobOutcome) -> bool {
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`, so this cannot happen while we borrow it.
                return JobOutcome::failure("job vanished");
            }
        }
    }

    pub fn set_progress(&self, value: f64) {
        self.record_progress_at(value, Instant::now());
    }

    pub(crate) fn record_progress_at(&self, value: f64, at: Instant) {
        self.lock_progress().record(value, at);
    }

    pub fn progress(&self) -> Option<f64> {
        self.lock_progress().value
    }

    pub fn expected_end(&self) -> Option<DateTime<Utc>> {
        self.lock_progress().expected_end
    }

    pub fn info(&self) -> JobInfo {
        let progress = self.lock_progress();
        JobInfo {
            path: self.path.clone(),
            operation: self.operation.clone(),
            started_by_uid: self.started_by,
            strategy: self.strategy,
            cancelable: true,
            cancelled: self.cancel.is_cancelled(),
            started_at: self.started_at,
            objects: self.objects.clone(),
            progress: progress.value,
            expected_end: progress.expected_end,
            pid: self.pid(),
        }
    }

    fn lock_progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
