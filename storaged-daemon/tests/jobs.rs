use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use storaged_daemon::job::CANCELLED_MESSAGE;
use storaged_daemon::{
    CancelOutcome, Job, JobOutcome, JobRegistry, LaunchSpec, Liveness, ProcessSpec, ThreadJobError,
};

const WAIT: Duration = Duration::from_secs(10);

fn registry() -> (Arc<Liveness>, Arc<JobRegistry>) {
    let liveness = Arc::new(Liveness::new(false));
    let jobs = JobRegistry::new(liveness.clone());
    (liveness, jobs)
}

fn spec(operation: &str) -> LaunchSpec {
    LaunchSpec::new(operation, 1000)
}

async fn wait(job: &Job) -> JobOutcome {
    tokio::time::timeout(WAIT, job.wait())
        .await
        .expect("job did not finish in time")
}

async fn process_gone(pid: u32) -> bool {
    for _ in 0..100 {
        if kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn false_reports_non_zero_exit_status() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(spec("test-false"), ProcessSpec::new(["/bin/false"]));

    let outcome = wait(&job).await;
    assert!(!outcome.success);
    assert!(
        outcome.message.contains("exited with non-zero exit status 1"),
        "{}",
        outcome.message
    );
}

#[tokio::test]
async fn successful_process_reports_stderr_as_message() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(
        spec("test-ok"),
        ProcessSpec::new(["sh", "-c", "echo out; echo 'all good' >&2"]),
    );

    let outcome = wait(&job).await;
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.message.trim(), "all good");
}

#[tokio::test]
async fn cancelling_sleep_kills_the_child() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(spec("test-sleep"), ProcessSpec::new(["/bin/sleep", "1000"]));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut pid = job.pid();
    for _ in 0..50 {
        if pid.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        pid = job.pid();
    }
    assert!(job.cancel_flag().cancel());

    let outcome = wait(&job).await;
    assert_eq!(outcome, JobOutcome::cancelled());
    let pid = pid.expect("child never spawned");
    assert!(process_gone(pid).await, "pid {pid} still running");
}

#[tokio::test]
async fn second_cancel_and_cancel_after_completion_change_nothing() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(spec("test-sleep"), ProcessSpec::new(["/bin/sleep", "1000"]));
    let path = job.path().clone();

    assert_eq!(jobs.cancel(&path), Ok(CancelOutcome::Requested));
    assert_eq!(
        jobs.cancel(&path),
        Ok(CancelOutcome::AlreadyCancelled)
    );
    let first = wait(&job).await;

    let done = jobs.launch_process(spec("test-true"), ProcessSpec::new(["/bin/true"]));
    let natural = wait(&done).await;
    assert!(natural.success);
    done.cancel_flag().cancel();
    assert_eq!(done.outcome(), Some(natural));
    assert_eq!(job.outcome(), Some(first));
}

#[tokio::test]
async fn ids_are_unique_and_start_at_zero() {
    let (_, jobs) = registry();
    let a = jobs.launch_process(spec("a"), ProcessSpec::new(["/bin/true"]));
    let b = jobs.launch_process(spec("b"), ProcessSpec::new(["/bin/true"]));
    let c = jobs.launch_thread(spec("c"), |_| Ok(()));

    assert_eq!(a.path().as_str(), "/org/storaged/jobs/0");
    assert_eq!(b.path().as_str(), "/org/storaged/jobs/1");
    assert_eq!(c.path().as_str(), "/org/storaged/jobs/2");
    for job in [&a, &b, &c] {
        wait(job).await;
    }
}

#[tokio::test]
async fn child_sees_end_of_input() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(
        spec("test-cat"),
        ProcessSpec::new(["cat"])
            .input(b"secret passphrase".to_vec())
            .on_complete(|_, output| JobOutcome::success(output.stdout_text())),
    );

    let outcome = wait(&job).await;
    assert!(outcome.success);
    assert_eq!(outcome.message, "secret passphrase");
}

#[tokio::test]
async fn spawn_failure_names_the_command_line() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(
        spec("test-missing"),
        ProcessSpec::new(["/nonexistent/storaged-helper", "--flag"]),
    );

    let outcome = wait(&job).await;
    assert!(!outcome.success);
    assert!(
        outcome
            .message
            .starts_with("Error spawning command-line `/nonexistent/storaged-helper --flag'"),
        "{}",
        outcome.message
    );
}

#[tokio::test]
async fn signaled_child_reports_the_signal() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(
        spec("test-abort"),
        ProcessSpec::new(["sh", "-c", "echo dying >&2; kill -ABRT $$"]),
    );

    let outcome = wait(&job).await;
    assert!(!outcome.success);
    assert!(
        outcome.message.contains("was signaled with signal SIGABRT (6)"),
        "{}",
        outcome.message
    );
}

#[tokio::test]
async fn completion_override_decides_the_outcome() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(
        spec("test-override"),
        ProcessSpec::new(["/bin/false"]).on_complete(|program, _| {
            JobOutcome::success(format!("{program} failing is fine here"))
        }),
    );

    let outcome = wait(&job).await;
    assert!(outcome.success);
    assert!(outcome.message.ends_with("failing is fine here"));
}

#[tokio::test]
async fn thread_job_success_and_failure() {
    let (_, jobs) = registry();
    let ok = jobs.launch_thread(spec("thread-ok"), |ctx| {
        ctx.set_progress(0.5);
        Ok(())
    });
    let bad = jobs.launch_thread(spec("thread-bad"), |_| {
        Err(ThreadJobError::Failed("disk on fire".to_string()))
    });

    assert!(wait(&ok).await.success);
    let outcome = wait(&bad).await;
    assert!(!outcome.success);
    assert_eq!(outcome.message, "Threaded job failed with error: disk on fire");
}

#[tokio::test]
async fn thread_job_observes_cancellation() {
    let (_, jobs) = registry();
    let job = jobs.launch_thread(spec("thread-loop"), |ctx| loop {
        ctx.check_cancelled()?;
        std::thread::sleep(Duration::from_millis(5));
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(job.cancel_flag().cancel());
    let outcome = wait(&job).await;
    assert!(!outcome.success);
    assert_eq!(
        outcome.message,
        format!("Threaded job failed with error: {CANCELLED_MESSAGE}")
    );
}

#[tokio::test]
async fn jobs_hold_the_daemon_alive() {
    let (liveness, jobs) = registry();
    let job = jobs.launch_process(spec("test-sleep"), ProcessSpec::new(["/bin/sleep", "1000"]));

    assert_eq!(liveness.snapshot().jobs, 1);
    assert!(!liveness.snapshot().may_exit());
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs.list()[0].operation, "test-sleep");

    job.cancel_flag().cancel();
    wait(&job).await;
    for _ in 0..50 {
        if liveness.snapshot().jobs == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(jobs.is_empty());
    assert!(jobs.get(job.path()).is_none());
    assert!(liveness.snapshot().may_exit());
}

#[tokio::test]
async fn parent_token_cancels_children() {
    let (_, jobs) = registry();
    let parent = CancellationToken::new();
    let first = jobs.launch_process(
        spec("child-a").parent(parent.clone()),
        ProcessSpec::new(["/bin/sleep", "1000"]),
    );
    let second = jobs.launch_thread(spec("child-b").parent(parent.clone()), |ctx| loop {
        ctx.check_cancelled()?;
        std::thread::sleep(Duration::from_millis(5));
    });

    parent.cancel();
    assert_eq!(wait(&first).await, JobOutcome::cancelled());
    let outcome = wait(&second).await;
    assert!(!outcome.success);
    assert!(outcome.message.ends_with(CANCELLED_MESSAGE), "{}", outcome.message);
}

#[tokio::test]
async fn job_ends_when_child_exits_despite_background_descendant() {
    let (_, jobs) = registry();
    let job = jobs.launch_process(
        spec("test-forking"),
        ProcessSpec::new(["/bin/sh", "-c", "sleep 5 & echo started >&2; exit 0"]),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(3), job.wait())
        .await
        .expect("job should end with its child, not with the descendant");
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.message.trim(), "started");
}
