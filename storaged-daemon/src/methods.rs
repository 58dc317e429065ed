//! Method routing and handlers.
//!
//! A call is first routed (unknown objects, methods and malformed
//! arguments are rejected), then authorized, then handled.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use storaged_core::{ObjectPath, PeerId, Uid};
use storaged_sync::{EntityKind, PublishedObject};

use crate::bus::MethodCall;
use crate::daemon::Daemon;
use crate::error::MethodError;
use crate::jobs::{CancelOutcome, LaunchSpec};
use crate::paths::{BLOCK_INTERFACE, JOB_INTERFACE, MANAGER_INTERFACE, MANAGER_PATH};
use crate::spawned::ProcessSpec;
use crate::threaded::ThreadJobError;

const SCAN_CHUNK: usize = 1 << 20;
const DEFAULT_WAIT_MS: u64 = 5_000;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug)]
enum Route {
    GetObjects,
    GetJobs,
    Status,
    Resync,
    WaitForObject { path: ObjectPath, timeout: Duration },
    Shutdown,
    CancelJob { job: ObjectPath, owner: Uid },
    Rescan { block: PublishedObject, device: String },
    Scan { block: PublishedObject, device: String, size: u64 },
}

#[derive(Debug, Deserialize)]
struct WaitArgs {
    path: ObjectPath,
    timeout_ms: Option<u64>,
}

/// Route, authorize and run one call from `sender`.
pub async fn handle_call(daemon: &Arc<Daemon>, sender: &PeerId, call: MethodCall) -> Result<Value, MethodError> {
    daemon.resolver().track(sender);
    let route = route(daemon, &call).await?;
    let job_owner = match &route {
        Route::CancelJob { owner, .. } => Some(*owner),
        _ => None,
    };
    let caller = daemon.authorizer().authorize(sender, &call, job_owner).await?;
    tracing::debug!(member = %call.member(), object = %call.object, uid = caller.uid, "dispatching");

    match route {
        Route::GetObjects => Ok(json!(daemon.objects().await)),
        Route::GetJobs => Ok(json!(daemon.jobs().list())),
        Route::Status => Ok(daemon.status().await),
        Route::Resync => daemon
            .resync("method")
            .await
            .map(|report| json!(report))
            .map_err(|err| MethodError::Failed(err.to_string())),
        Route::WaitForObject { path, timeout } => daemon
            .wait_for_object(&path, timeout)
            .await
            .map(|object| json!(object)),
        Route::Shutdown => {
            tracing::info!(uid = caller.uid, "shutdown requested");
            // Let the reply reach the caller before the listener closes.
            let daemon = daemon.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                daemon.shutdown();
            });
            Ok(json!({ "stopping": true }))
        }
        Route::CancelJob { job, .. } => match daemon.jobs().cancel(&job)? {
            CancelOutcome::Requested | CancelOutcome::AlreadyFinished => Ok(json!({})),
            CancelOutcome::AlreadyCancelled => Err(MethodError::AlreadyCancelled(
                "The job has already been cancelled".to_string(),
            )),
        },
        Route::Rescan { block, device } => rescan(daemon, caller.uid, block, device).await,
        Route::Scan { block, device, size } => Ok(scan(daemon, caller.uid, block, device, size)),
    }
}

async fn route(daemon: &Daemon, call: &MethodCall) -> Result<Route, MethodError> {
    let unknown_method = || {
        MethodError::UnknownMethod(format!(
            "No such method {} on object {}",
            call.member(),
            call.object
        ))
    };

    match call.interface.as_str() {
        MANAGER_INTERFACE => {
            if call.object.as_str() != MANAGER_PATH {
                return Err(unknown_method());
            }
            match call.method.as_str() {
                "GetObjects" => Ok(Route::GetObjects),
                "GetJobs" => Ok(Route::GetJobs),
                "Status" => Ok(Route::Status),
                "Resync" => Ok(Route::Resync),
                "Shutdown" => Ok(Route::Shutdown),
                "WaitForObject" => {
                    let args: WaitArgs = serde_json::from_value(call.args.clone())
                        .map_err(|err| MethodError::InvalidArgs(err.to_string()))?;
                    Ok(Route::WaitForObject {
                        path: args.path,
                        timeout: Duration::from_millis(args.timeout_ms.unwrap_or(DEFAULT_WAIT_MS)),
                    })
                }
                _ => Err(unknown_method()),
            }
        }
        JOB_INTERFACE => {
            if call.method != "Cancel" {
                return Err(unknown_method());
            }
            let job = daemon
                .jobs()
                .get(&call.object)
                .ok_or_else(|| MethodError::UnknownObject(format!("No job at {}", call.object)))?;
            Ok(Route::CancelJob {
                job: call.object.clone(),
                owner: job.started_by(),
            })
        }
        BLOCK_INTERFACE => {
            let block = daemon
                .lookup(&call.object)
                .await
                .ok_or_else(|| MethodError::UnknownObject(format!("No object at {}", call.object)))?;
            let EntityKind::Block { device, size } = block.entity.kind.clone() else {
                return Err(unknown_method());
            };
            match call.method.as_str() {
                "Rescan" => Ok(Route::Rescan { block, device }),
                "Scan" => Ok(Route::Scan { block, device, size }),
                _ => Err(unknown_method()),
            }
        }
        _ => Err(unknown_method()),
    }
}

/// Ask udev to re-probe the device and wait for the job.
async fn rescan(daemon: &Arc<Daemon>, uid: Uid, block: PublishedObject, device: String) -> Result<Value, MethodError> {
    let mut argv = daemon.config().rescan_command.clone();
    argv.push(device);
    let job = daemon.jobs().launch_process(
        LaunchSpec::new("block-rescan", uid).object(block.path),
        ProcessSpec::new(argv),
    );
    let outcome = job.wait().await;
    if outcome.success {
        Ok(json!({ "job": job.path(), "message": outcome.message }))
    } else {
        Err(MethodError::Failed(format!(
            "Error rescanning device: {}",
            outcome.message
        )))
    }
}

/// Read the whole device in the background, reporting progress.
fn scan(daemon: &Arc<Daemon>, uid: Uid, block: PublishedObject, device: String, size: u64) -> Value {
    let job = daemon.jobs().launch_thread(
        LaunchSpec::new("block-scan", uid).object(block.path),
        move |ctx| {
            let mut file = File::open(&device)
                .map_err(|err| ThreadJobError::Failed(format!("Error opening {device}: {err}")))?;
            let mut buf = vec![0u8; SCAN_CHUNK];
            let mut done = 0u64;
            loop {
                ctx.check_cancelled()?;
                let n = file
                    .read(&mut buf)
                    .map_err(|err| ThreadJobError::Failed(format!("Error reading {device}: {err}")))?;
                if n == 0 {
                    break;
                }
                done += n as u64;
                if size > 0 {
                    ctx.set_progress(done as f64 / size as f64);
                }
            }
            ctx.set_progress(1.0);
            Ok(())
        },
    );
    json!({ "job": job.path() })
}
