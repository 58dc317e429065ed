//! storaged daemon: caller authorization, job execution, object sync and
//! the Unix socket front end.

pub mod authority;
pub mod authorize;
pub mod bus;
pub mod credentials;
mod daemon;
mod error;
pub mod job;
pub mod jobs;
pub mod liveness;
pub mod methods;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod spawned;
pub mod threaded;

pub use authority::{AuthorityError, AuthorizationRequest, AuthorizationResult, PolicyAuthority};
pub use authorize::{Authorized, Authorizer, PolicyAnnotation, PolicyTable};
pub use bus::{MethodCall, PeerCredentials, PeerDirectory, SocketPeers};
pub use credentials::{ClientEvent, CredentialError, CredentialResolver};
pub use daemon::{Daemon, DaemonBuilder, ObjectEvent};
pub use error::{BusError, DaemonError, MethodError};
pub use job::{CancelFlag, Job, JobInfo, JobOutcome, Strategy};
pub use jobs::{CancelOutcome, JobEvent, JobRegistry, LaunchSpec};
pub use liveness::{Liveness, Quiescence};
pub use protocol::{
    call, request_cancel, request_jobs, request_objects, request_resync, request_status,
    request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, serve, start_blocking};
pub use spawned::{ProcessOutput, ProcessSpec};
pub use threaded::{ThreadContext, ThreadJobError};
