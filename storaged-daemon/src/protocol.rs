//! Newline-delimited JSON protocol over the daemon's Unix socket.
//!
//! ```text
//! → {"object":"/org/storaged/Manager","interface":"org.storaged.Manager","method":"Status"}
//! ← {"ok":true,"data":{...}}
//! ← {"ok":false,"error":{"name":"org.storaged.Error.NotAuthorized","message":"..."}}
//! ```

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use storaged_core::ObjectPath;

use crate::bus::MethodCall;
use crate::error::{io_err, DaemonError, MethodError};
use crate::paths::{JOB_INTERFACE, MANAGER_INTERFACE, MANAGER_PATH, NO_USER_INTERACTION_OPTION};

pub type DaemonRequest = MethodCall;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(err: &MethodError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                name: err.name(),
                message: err.message().to_string(),
            }),
        }
    }

    pub fn from_result(result: Result<Value, MethodError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::error(&err),
        }
    }

    pub fn into_result(self) -> Result<Value, MethodError> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        Err(match self.error {
            Some(body) => MethodError::from_wire(&body.name, body.message),
            None => MethodError::Failed("unknown daemon error".to_string()),
        })
    }
}

/// Send one request to the daemon socket and return one response.
pub fn send_request(socket: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning {
            socket: socket.to_path_buf(),
        });
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Make one call and unwrap its result.
pub fn call(socket: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    Ok(send_request(socket, request)?.into_result()?)
}

fn manager(method: &str) -> MethodCall {
    MethodCall::new(MANAGER_PATH, MANAGER_INTERFACE, method)
}

/// `Manager.Status`, retrying briefly while the daemon starts up.
pub fn request_status(socket: &Path) -> Result<Value, DaemonError> {
    let request = manager("Status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match call(socket, &request) {
            Ok(data) => return Ok(data),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_objects(socket: &Path) -> Result<Value, DaemonError> {
    call(socket, &manager("GetObjects"))
}

pub fn request_jobs(socket: &Path) -> Result<Value, DaemonError> {
    call(socket, &manager("GetJobs"))
}

pub fn request_resync(socket: &Path) -> Result<Value, DaemonError> {
    call(socket, &manager("Resync"))
}

pub fn request_stop(socket: &Path) -> Result<(), DaemonError> {
    call(socket, &manager("Shutdown")).map(|_| ())
}

pub fn request_cancel(socket: &Path, job: &ObjectPath, no_user_interaction: bool) -> Result<(), DaemonError> {
    let request = MethodCall::new(job.clone(), JOB_INTERFACE, "Cancel").with_args(json!({
        "options": { NO_USER_INTERACTION_OPTION: no_user_interaction }
    }));
    call(socket, &request).map(|_| ())
}
