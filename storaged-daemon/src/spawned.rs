//! Process-backed jobs.
//!
//! The child gets its own stdin (fed from an optional secret input that is
//! wiped afterwards) and piped stdout/stderr. The job ends when the child
//! exits; whatever is still buffered in the pipes is read for a short grace
//! period afterwards, as descendants may hold them open. When the job is
//! cancelled the child receives SIGTERM and is reaped in the background.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{compiler_fence, Ordering};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{geteuid, getuid, initgroups, setgroups, setresgid, setresuid, Pid, User};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use storaged_core::Uid;

use crate::job::{Job, JobOutcome};

/// How long output is still read once the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Input for the child's stdin. Zeroed when dropped.
pub struct SecretInput(Vec<u8>);

impl SecretInput {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for SecretInput {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = 0;
        }
        compiler_fence(Ordering::SeqCst);
    }
}

impl fmt::Debug for SecretInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretInput({} bytes)", self.0.len())
    }
}

/// Real and effective uid the child runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAs {
    pub uid: Uid,
    pub euid: Uid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Turns the program name and its collected output into the job outcome.
pub type CompletionCheck = Box<dyn FnOnce(&str, &ProcessOutput) -> JobOutcome + Send>;

pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub input: Option<SecretInput>,
    pub run_as: Option<RunAs>,
    pub completion: Option<CompletionCheck>,
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("argv", &self.argv)
            .field("input", &self.input)
            .field("run_as", &self.run_as)
            .field("completion", &self.completion.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl ProcessSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            input: None,
            run_as: None,
            completion: None,
        }
    }

    pub fn input(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.input = Some(SecretInput::new(bytes));
        self
    }

    pub fn run_as(mut self, uid: Uid, euid: Uid) -> Self {
        self.run_as = Some(RunAs { uid, euid });
        self
    }

    /// Replace [`default_check`] for this job.
    pub fn on_complete(
        mut self,
        check: impl FnOnce(&str, &ProcessOutput) -> JobOutcome + Send + 'static,
    ) -> Self {
        self.completion = Some(Box::new(check));
        self
    }
}

pub fn command_line(argv: &[String]) -> String {
    argv.join(" ")
}

pub(crate) async fn run(job: &Job, spec: ProcessSpec) -> JobOutcome {
    let cancel = job.cancel_flag().clone();
    if cancel.is_cancelled() {
        return JobOutcome::cancelled();
    }

    let ProcessSpec {
        argv,
        input,
        run_as,
        completion,
    } = spec;
    let cmdline = command_line(&argv);
    let spawn_error = |err: &dyn fmt::Display| {
        JobOutcome::failure(format!("Error spawning command-line `{cmdline}': {err}"))
    };
    let Some(program) = argv.first().cloned() else {
        return spawn_error(&"empty command line");
    };

    let mut command = Command::new(&program);
    command
        .args(&argv[1..])
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(run_as) = run_as {
        if let Err(err) = switch_user(&mut command, run_as) {
            return spawn_error(&err);
        }
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return spawn_error(&err),
    };
    job.set_pid(child.id());
    tracing::debug!(job = %job.path(), pid = ?child.id(), %cmdline, "spawned job process");

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = collect(&mut child, stdin, input, stdout, stderr) => Some(output),
    };

    let outcome = match finished {
        None => {
            terminate(child, &program);
            JobOutcome::cancelled()
        }
        Some(Err(err)) => JobOutcome::failure(format!("Error waiting for `{cmdline}': {err}")),
        Some(Ok(output)) => match completion {
            Some(check) => check(&program, &output),
            None => default_check(&program, &output),
        },
    };
    job.set_pid(None);
    outcome
}

async fn collect(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    input: Option<SecretInput>,
    stdout: Option<impl AsyncRead + Unpin>,
    stderr: Option<impl AsyncRead + Unpin>,
) -> io::Result<ProcessOutput> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let status = {
        let write = async move {
            if let (Some(mut pipe), Some(input)) = (stdin, input) {
                // A child that exits without reading its input is not our failure.
                let _ = pipe.write_all(input.as_bytes()).await;
                let _ = pipe.shutdown().await;
            }
            Ok::<_, io::Error>(())
        };
        let pipes = async {
            tokio::try_join!(write, read_into(stdout, &mut out), read_into(stderr, &mut err))
                .map(|_| ())
        };
        tokio::pin!(pipes);

        let mut drained = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                result = &mut pipes, if !drained => {
                    result?;
                    drained = true;
                }
            }
        };
        // Descendants may keep the pipes open past the child's exit.
        if !drained {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut pipes).await {
                Ok(result) => result?,
                Err(_) => tracing::debug!(%status, "job process left its pipes open, keeping partial output"),
            }
        }
        status
    };
    Ok(ProcessOutput {
        status,
        stdout: out,
        stderr: err,
    })
}

async fn read_into(pipe: Option<impl AsyncRead + Unpin>, buf: &mut Vec<u8>) -> io::Result<()> {
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(buf).await?;
    }
    Ok(())
}

fn terminate(mut child: Child, program: &str) {
    if let Some(pid) = child.id() {
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, %program, error = %err, "cannot signal cancelled job process");
        }
    }
    let program = program.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::debug!(%program, %status, "reaped cancelled job process"),
            Err(err) => tracing::warn!(%program, error = %err, "cannot reap cancelled job process"),
        }
    });
}

/// Drop to `run_as` in the child before exec. A no-op when the daemon
/// already runs with those ids.
fn switch_user(command: &mut Command, run_as: RunAs) -> Result<(), String> {
    if run_as.uid == getuid().as_raw() && run_as.euid == geteuid().as_raw() {
        return Ok(());
    }
    let lookup = |uid: Uid| -> Result<User, String> {
        User::from_uid(nix::unistd::Uid::from_raw(uid))
            .map_err(|err| format!("Error looking up uid {uid}: {err}"))?
            .ok_or_else(|| format!("No password record for uid {uid}"))
    };
    let real = lookup(run_as.uid)?;
    let effective = lookup(run_as.euid)?;
    let name = CString::new(real.name.as_str())
        .map_err(|_| format!("Invalid user name for uid {}", run_as.uid))?;
    let (uid, gid) = (real.uid, real.gid);
    let (euid, egid) = (effective.uid, effective.gid);

    // SAFETY: runs in the forked child before exec and only calls the
    // set*id family; any failure aborts the spawn instead of running the
    // program with the wrong identity.
    unsafe {
        command.pre_exec(move || {
            setgroups(&[])?;
            initgroups(&name, gid)?;
            setresgid(gid, egid, egid)?;
            setresuid(uid, euid, euid)?;
            Ok(())
        });
    }
    Ok(())
}

/// Outcome of a finished process when the job supplies no check of its own.
///
/// Success needs exit status 0 and no stderr line starting with
/// `<program name>:`, the way tools conventionally prefix their
/// diagnostics. The success message is whatever the program wrote to stderr.
pub fn default_check(program: &str, output: &ProcessOutput) -> JobOutcome {
    let stderr = output.stderr_text();
    if let Err(message) = check_status(program, output.status, &stderr) {
        return JobOutcome::failure(message);
    }
    let name = program.rsplit('/').next().unwrap_or(program);
    let prefix = format!("{name}:");
    if stderr.lines().any(|line| line.starts_with(&prefix)) {
        return JobOutcome::failure(format!("{program} reported an error: {}", stderr.trim_end()));
    }
    JobOutcome::success(stderr)
}

/// `Ok` for exit status 0; otherwise a message naming how the program ended.
pub fn check_status(program: &str, status: ExitStatus, stderr: &str) -> Result<(), String> {
    let head = if let Some(code) = status.code() {
        if code == 0 {
            return Ok(());
        }
        format!("{program} exited with non-zero exit status {code}")
    } else if let Some(signal) = status.signal() {
        let name = Signal::try_from(signal)
            .map(Signal::as_str)
            .unwrap_or("an unknown signal");
        format!("{program} was signaled with signal {name} ({signal})")
    } else {
        format!("{program} terminated abnormally")
    };
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        Err(head)
    } else {
        Err(format!("{head}: {stderr}"))
    }
}
