//! Thread-backed jobs.
//!
//! The job function runs on a dedicated OS thread and must poll
//! [`ThreadContext::check_cancelled`] to honour cancellation. It runs even
//! if the job was cancelled before the thread started; the function decides
//! what an early cancel means.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::job::{CancelFlag, Job, JobOutcome, CANCELLED_MESSAGE};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadJobError {
    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// What a job function may touch: its own cancel flag and progress.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    job: Arc<Job>,
}

impl ThreadContext {
    pub fn cancel_flag(&self) -> &CancelFlag {
        self.job.cancel_flag()
    }

    pub fn is_cancelled(&self) -> bool {
        self.job.cancel_flag().is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), ThreadJobError> {
        if self.is_cancelled() {
            Err(ThreadJobError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn set_progress(&self, value: f64) {
        self.job.set_progress(value);
    }
}

pub type ThreadResult = Result<(), ThreadJobError>;

/// Outcome of a finished job function.
pub fn default_completion(result: ThreadResult) -> JobOutcome {
    match result {
        Ok(()) => JobOutcome::success(""),
        Err(err) => JobOutcome::failure(format!("Threaded job failed with error: {err}")),
    }
}

pub(crate) async fn run<F>(job: Arc<Job>, func: F) -> JobOutcome
where
    F: FnOnce(&ThreadContext) -> ThreadResult + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let ctx = ThreadContext { job: job.clone() };
    let spawned = std::thread::Builder::new()
        .name(format!("job-{}", job.id()))
        .spawn(move || {
            let result = func(&ctx);
            let _ = tx.send(result);
        });
    if let Err(err) = spawned {
        return JobOutcome::failure(format!("Error starting job thread: {err}"));
    }
    match rx.await {
        Ok(result) => default_completion(result),
        Err(_) => default_completion(Err(ThreadJobError::Failed(
            "job thread panicked".to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_prefixed() {
        assert_eq!(
            default_completion(Err(ThreadJobError::Failed("disk on fire".into()))),
            JobOutcome::failure("Threaded job failed with error: disk on fire")
        );
        assert_eq!(
            default_completion(Err(ThreadJobError::Cancelled)).message,
            "Threaded job failed with error: Operation was cancelled"
        );
        assert!(default_completion(Ok(())).success);
    }
}
