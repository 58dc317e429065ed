//! Job registry.
//!
//! Jobs are numbered from 0 for the lifetime of the daemon and published at
//! `/org/storaged/jobs/<n>` until they finish. Each running job holds the
//! daemon alive through [`Liveness`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use storaged_core::{JobId, ObjectPath, Uid};

use crate::error::MethodError;
use crate::job::{CancelFlag, Job, JobInfo, JobOutcome, Strategy};
use crate::liveness::Liveness;
use crate::paths::{job_id_from_path, job_path};
use crate::spawned::{self, ProcessSpec};
use crate::threaded::{self, ThreadContext, ThreadResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Launched {
        path: ObjectPath,
        operation: String,
    },
    Completed {
        path: ObjectPath,
        operation: String,
        outcome: JobOutcome,
    },
}

/// Caller-side description shared by both job strategies.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub operation: String,
    pub started_by: Uid,
    /// Published objects the job operates on.
    pub objects: Vec<ObjectPath>,
    /// Cancelling this token cancels the job too.
    pub parent: Option<CancellationToken>,
}

impl LaunchSpec {
    pub fn new(operation: impl Into<String>, started_by: Uid) -> Self {
        Self {
            operation: operation.into(),
            started_by,
            objects: Vec::new(),
            parent: None,
        }
    }

    pub fn object(mut self, path: ObjectPath) -> Self {
        self.objects.push(path);
        self
    }

    pub fn parent(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    AlreadyCancelled,
    /// The job had finished; nothing to cancel.
    AlreadyFinished,
}

#[derive(Debug)]
pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: Mutex<BTreeMap<JobId, Arc<Job>>>,
    liveness: Arc<Liveness>,
    events: broadcast::Sender<JobEvent>,
}

impl JobRegistry {
    pub fn new(liveness: Arc<Liveness>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            jobs: Mutex::new(BTreeMap::new()),
            liveness,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Run `process` as a child of the daemon. Must be called from within
    /// the runtime.
    pub fn launch_process(self: &Arc<Self>, spec: LaunchSpec, process: ProcessSpec) -> Arc<Job> {
        let job = self.register(spec, Strategy::Process);
        let registry = self.clone();
        let running = job.clone();
        tokio::spawn(async move {
            let outcome = spawned::run(&running, process).await;
            registry.finish(&running, outcome);
        });
        job
    }

    /// Run `func` on a dedicated thread. Must be called from within the
    /// runtime.
    pub fn launch_thread<F>(self: &Arc<Self>, spec: LaunchSpec, func: F) -> Arc<Job>
    where
        F: FnOnce(&ThreadContext) -> ThreadResult + Send + 'static,
    {
        let job = self.register(spec, Strategy::Thread);
        let registry = self.clone();
        let running = job.clone();
        tokio::spawn(async move {
            let outcome = threaded::run(running.clone(), func).await;
            registry.finish(&running, outcome);
        });
        job
    }

    fn register(&self, spec: LaunchSpec, strategy: Strategy) -> Arc<Job> {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cancel = match spec.parent {
            Some(parent) => CancelFlag::from_token(parent.child_token()),
            None => CancelFlag::new(),
        };
        let job = Arc::new(Job::new(
            id,
            job_path(id),
            spec.operation,
            spec.started_by,
            strategy,
            spec.objects,
            cancel,
        ));
        self.lock().insert(id, job.clone());
        self.liveness.job_started();
        tracing::info!(
            job = %job.path(),
            operation = %job.operation(),
            uid = job.started_by(),
            ?strategy,
            "job launched",
        );
        let _ = self.events.send(JobEvent::Launched {
            path: job.path().clone(),
            operation: job.operation().to_string(),
        });
        job
    }

    fn finish(&self, job: &Arc<Job>, outcome: JobOutcome) {
        if !job.complete(outcome.clone()) {
            return;
        }
        self.lock().remove(&job.id());
        self.liveness.job_finished();
        tracing::info!(
            job = %job.path(),
            operation = %job.operation(),
            success = outcome.success,
            message = %outcome.message,
            "job completed",
        );
        let _ = self.events.send(JobEvent::Completed {
            path: job.path().clone(),
            operation: job.operation().to_string(),
            outcome,
        });
    }

    pub fn get(&self, path: &ObjectPath) -> Option<Arc<Job>> {
        let id = job_id_from_path(path)?;
        self.lock().get(&id).cloned()
    }

    /// Request cancellation of the job at `path`.
    pub fn cancel(&self, path: &ObjectPath) -> Result<CancelOutcome, MethodError> {
        let job = self
            .get(path)
            .ok_or_else(|| MethodError::UnknownObject(format!("No job at {path}")))?;
        if job.is_finished() {
            return Ok(CancelOutcome::AlreadyFinished);
        }
        if job.cancel_flag().cancel() {
            tracing::info!(job = %path, "job cancellation requested");
            Ok(CancelOutcome::Requested)
        } else {
            Ok(CancelOutcome::AlreadyCancelled)
        }
    }

    pub fn list(&self) -> Vec<JobInfo> {
        self.lock().values().map(|job| job.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<JobId, Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
