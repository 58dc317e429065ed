//! Well-known object paths, interfaces and policy action ids.

use storaged_core::{JobId, ObjectPath};

pub const MANAGER_PATH: &str = "/org/storaged/Manager";
pub const JOBS_PREFIX: &str = "/org/storaged/jobs";

pub const MANAGER_INTERFACE: &str = "org.storaged.Manager";
pub const JOB_INTERFACE: &str = "org.storaged.Job";
pub const BLOCK_INTERFACE: &str = "org.storaged.Block";

/// Checked for every method that carries no policy annotation of its own.
pub const DEFAULT_ACTION_ID: &str = "org.storaged.manage-storage";
pub const QUERY_ACTION_ID: &str = "org.storaged.query";
pub const RESCAN_ACTION_ID: &str = "org.storaged.rescan";
pub const READ_DEVICE_ACTION_ID: &str = "org.storaged.read-device";
pub const MANAGE_DAEMON_ACTION_ID: &str = "org.storaged.manage-daemon";
pub const CANCEL_JOB_ACTION_ID: &str = "org.storaged.cancel-job";
pub const CANCEL_JOB_OTHER_USER_ACTION_ID: &str = "org.storaged.cancel-job-other-user";

/// Option key in a call's `options` map that forbids interactive authentication.
pub const NO_USER_INTERACTION_OPTION: &str = "auth.no_user_interaction";

pub fn job_path(id: JobId) -> ObjectPath {
    ObjectPath(format!("{JOBS_PREFIX}/{}", id.0))
}

/// Inverse of [`job_path`].
pub fn job_id_from_path(path: &ObjectPath) -> Option<JobId> {
    path.as_str()
        .strip_prefix(JOBS_PREFIX)?
        .strip_prefix('/')?
        .parse()
        .ok()
        .map(JobId)
}
