//! Authorization middleware.
//!
//! Every routed call passes through [`Authorizer::authorize_blocking`]
//! before its handler runs:
//!
//! 1. Resolve the caller's uid (waiting for the credential lookup).
//! 2. Pick the action id: the job-cancel actions for `Job.Cancel`, the
//!    method's policy annotation otherwise, [`DEFAULT_ACTION_ID`] if none.
//! 3. Without an authority only uid 0 passes.
//! 4. Otherwise ask the authority and map its answer to a caller error.
//!
//! Any failure along the way denies the call.

use std::collections::HashMap;
use std::sync::Arc;

use storaged_core::{PeerId, Uid, ROOT_UID};

use crate::authority::{AuthorityError, AuthorizationRequest, AuthorizationResult, PolicyAuthority};
use crate::bus::MethodCall;
use crate::credentials::CredentialResolver;
use crate::error::MethodError;
use crate::paths::{
    BLOCK_INTERFACE, CANCEL_JOB_ACTION_ID, CANCEL_JOB_OTHER_USER_ACTION_ID, DEFAULT_ACTION_ID,
    JOB_INTERFACE, MANAGE_DAEMON_ACTION_ID, MANAGER_INTERFACE, QUERY_ACTION_ID,
    READ_DEVICE_ACTION_ID, RESCAN_ACTION_ID,
};

const NO_AUTHORITY_MESSAGE: &str =
    "Not authorized to perform operation (polkit authority not available and caller is not uid 0)";
const NOT_AUTHORIZED_MESSAGE: &str = "Not authorized to perform operation";
const DISMISSED_MESSAGE: &str = "The authentication dialog was dismissed";
const CANCEL_JOB_MESSAGE: &str = "Authentication is required to cancel a job";
const DEFAULT_MESSAGE: &str = "Authentication is required to manage storage";

/// Action id and prompt attached to one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyAnnotation {
    pub action_id: String,
    pub message: String,
}

impl PolicyAnnotation {
    pub fn new(action_id: &str, message: &str) -> Self {
        Self {
            action_id: action_id.to_string(),
            message: message.to_string(),
        }
    }
}

/// Per-method annotations, keyed by `(interface, method)`.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    annotations: HashMap<(String, String), PolicyAnnotation>,
}

impl PolicyTable {
    pub fn annotate(mut self, interface: &str, method: &str, annotation: PolicyAnnotation) -> Self {
        self.annotations
            .insert((interface.to_string(), method.to_string()), annotation);
        self
    }

    pub fn get(&self, interface: &str, method: &str) -> Option<&PolicyAnnotation> {
        self.annotations
            .get(&(interface.to_string(), method.to_string()))
    }

    /// Annotations of the daemon's own methods.
    pub fn builtin() -> Self {
        let query = PolicyAnnotation::new(
            QUERY_ACTION_ID,
            "Authentication is required to query storage state",
        );
        Self::default()
            .annotate(MANAGER_INTERFACE, "GetObjects", query.clone())
            .annotate(MANAGER_INTERFACE, "GetJobs", query.clone())
            .annotate(MANAGER_INTERFACE, "Status", query.clone())
            .annotate(MANAGER_INTERFACE, "WaitForObject", query)
            .annotate(
                MANAGER_INTERFACE,
                "Shutdown",
                PolicyAnnotation::new(
                    MANAGE_DAEMON_ACTION_ID,
                    "Authentication is required to stop the storage daemon",
                ),
            )
            .annotate(
                BLOCK_INTERFACE,
                "Rescan",
                PolicyAnnotation::new(RESCAN_ACTION_ID, "Authentication is required to rescan a device"),
            )
            .annotate(
                BLOCK_INTERFACE,
                "Scan",
                PolicyAnnotation::new(
                    READ_DEVICE_ACTION_ID,
                    "Authentication is required to read a device",
                ),
            )
    }
}

/// A call that passed authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorized {
    pub uid: Uid,
    pub action_id: String,
}

pub struct Authorizer {
    resolver: Arc<CredentialResolver>,
    authority: Option<Arc<dyn PolicyAuthority>>,
    policies: PolicyTable,
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("authority", &self.authority_name())
            .finish()
    }
}

impl Authorizer {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        authority: Option<Arc<dyn PolicyAuthority>>,
        policies: PolicyTable,
    ) -> Self {
        Self {
            resolver,
            authority,
            policies,
        }
    }

    pub fn authority_name(&self) -> &str {
        self.authority.as_deref().map_or("none", |a| a.name())
    }

    /// Action id and prompt checked for `call`. `job_owner` is the uid that
    /// started the job a `Job.Cancel` call targets.
    pub fn annotation_for(&self, call: &MethodCall, caller: Uid, job_owner: Option<Uid>) -> PolicyAnnotation {
        if call.interface == JOB_INTERFACE && call.method == "Cancel" {
            let action = match job_owner {
                Some(owner) if owner != caller => CANCEL_JOB_OTHER_USER_ACTION_ID,
                _ => CANCEL_JOB_ACTION_ID,
            };
            return PolicyAnnotation::new(action, CANCEL_JOB_MESSAGE);
        }
        self.policies
            .get(&call.interface, &call.method)
            .cloned()
            .unwrap_or_else(|| PolicyAnnotation::new(DEFAULT_ACTION_ID, DEFAULT_MESSAGE))
    }

    /// Decide whether `sender` may make `call`. Blocks on the credential
    /// lookup and on the authority.
    pub fn authorize_blocking(
        &self,
        sender: &PeerId,
        call: &MethodCall,
        job_owner: Option<Uid>,
    ) -> Result<Authorized, MethodError> {
        let uid = self
            .resolver
            .resolve_blocking(sender)
            .map_err(|err| MethodError::Failed(err.to_string()))?;
        let annotation = self.annotation_for(call, uid, job_owner);

        let Some(authority) = &self.authority else {
            return root_only(uid, annotation.action_id);
        };

        let request = AuthorizationRequest {
            action_id: annotation.action_id.clone(),
            message: annotation.message,
            uid,
            pid: self.resolver.peer_pid(sender),
            allow_user_interaction: !call.no_user_interaction(),
        };
        let result = match authority.check(&request) {
            Ok(result) => result,
            Err(AuthorityError::Unavailable(reason)) => {
                tracing::warn!(%reason, "policy authority unreachable; falling back to root-only");
                return root_only(uid, annotation.action_id);
            }
            Err(AuthorityError::Policy(message)) => {
                return Err(MethodError::Failed(format!(
                    "Error checking authorization: {message}"
                )));
            }
        };

        match result {
            AuthorizationResult::Authorized => Ok(Authorized {
                uid,
                action_id: annotation.action_id,
            }),
            AuthorizationResult::Dismissed => Err(MethodError::NotAuthorizedDismissed(
                DISMISSED_MESSAGE.to_string(),
            )),
            AuthorizationResult::Challenge => Err(MethodError::NotAuthorizedCanObtain(
                NOT_AUTHORIZED_MESSAGE.to_string(),
            )),
            AuthorizationResult::NotAuthorized => {
                Err(MethodError::NotAuthorized(NOT_AUTHORIZED_MESSAGE.to_string()))
            }
        }
    }

    /// Run [`Self::authorize_blocking`] on a blocking thread.
    pub async fn authorize(
        self: &Arc<Self>,
        sender: &PeerId,
        call: &MethodCall,
        job_owner: Option<Uid>,
    ) -> Result<Authorized, MethodError> {
        let this = self.clone();
        let sender = sender.clone();
        let call = call.clone();
        let member = call.member();
        let verdict = tokio::task::spawn_blocking(move || {
            this.authorize_blocking(&sender, &call, job_owner)
        })
        .await
        .map_err(|err| MethodError::Failed(format!("authorization task failed: {err}")))?;
        match &verdict {
            Ok(ok) => tracing::debug!(%member, uid = ok.uid, action = %ok.action_id, "authorized"),
            Err(err) => tracing::info!(%member, error = %err, "call denied"),
        }
        verdict
    }
}

fn root_only(uid: Uid, action_id: String) -> Result<Authorized, MethodError> {
    if uid == ROOT_UID {
        Ok(Authorized { uid, action_id })
    } else {
        Err(MethodError::NotAuthorized(NO_AUTHORITY_MESSAGE.to_string()))
    }
}
