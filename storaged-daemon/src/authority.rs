//! Policy authority backends.
//!
//! An authority answers "may uid U perform action A?". Checks are
//! synchronous and run on blocking threads.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;

use storaged_core::{AuthorityConfig, PolicyAnswer, Uid, ROOT_UID};

/// Everything an authority may look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub action_id: String,
    /// Shown to the user if authentication is needed.
    pub message: String,
    pub uid: Uid,
    pub pid: Option<i32>,
    pub allow_user_interaction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationResult {
    Authorized,
    NotAuthorized,
    /// Not authorized, but could become so by authenticating.
    Challenge,
    /// The user dismissed the authentication dialog.
    Dismissed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    /// The authority could not be reached at all.
    #[error("policy authority unavailable: {0}")]
    Unavailable(String),
    /// The authority was reached and reported an error.
    #[error("{0}")]
    Policy(String),
}

pub trait PolicyAuthority: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, request: &AuthorizationRequest) -> Result<AuthorizationResult, AuthorityError>;
}

/// Build the authority named by `config`; `None` means no authority.
pub fn from_config(config: &AuthorityConfig) -> Option<Arc<dyn PolicyAuthority>> {
    match config {
        AuthorityConfig::None => None,
        AuthorityConfig::Static {
            rules,
            default_answer,
        } => {
            let rules = rules
                .iter()
                .map(|rule| (rule.action_id.clone(), rule.answer))
                .collect();
            Some(Arc::new(StaticAuthority::new(rules, *default_answer)))
        }
        AuthorityConfig::Pkcheck { binary } => {
            if !binary.exists() {
                tracing::warn!(
                    binary = %binary.display(),
                    "pkcheck not found; only uid 0 will be authorized",
                );
                return None;
            }
            Some(Arc::new(PkcheckAuthority::new(binary.clone())))
        }
    }
}

/// polkit, queried through its `pkcheck` helper.
///
/// Exit codes: 0 authorized, 1 not authorized, 2 authentication could
/// obtain it, 3 dialog dismissed, anything else an error.
#[derive(Debug, Clone)]
pub struct PkcheckAuthority {
    binary: PathBuf,
}

impl PkcheckAuthority {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args(request: &AuthorizationRequest, pid: i32) -> Vec<String> {
        let mut args = vec![
            "--action-id".to_string(),
            request.action_id.clone(),
            "--process".to_string(),
            pid.to_string(),
            "--detail".to_string(),
            "polkit.message".to_string(),
            request.message.clone(),
        ];
        if request.allow_user_interaction {
            args.push("--allow-user-interaction".to_string());
        }
        args
    }
}

impl PolicyAuthority for PkcheckAuthority {
    fn name(&self) -> &str {
        "pkcheck"
    }

    fn check(&self, request: &AuthorizationRequest) -> Result<AuthorizationResult, AuthorityError> {
        let pid = request
            .pid
            .ok_or_else(|| AuthorityError::Policy("caller process is unknown".to_string()))?;
        let output = Command::new(&self.binary)
            .args(Self::args(request, pid))
            .stdin(Stdio::null())
            .output()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    AuthorityError::Unavailable(format!("{}: {err}", self.binary.display()))
                }
                _ => AuthorityError::Policy(err.to_string()),
            })?;
        match output.status.code() {
            Some(0) => Ok(AuthorizationResult::Authorized),
            Some(1) => Ok(AuthorizationResult::NotAuthorized),
            Some(2) => Ok(AuthorizationResult::Challenge),
            Some(3) => Ok(AuthorizationResult::Dismissed),
            Some(127) => Err(AuthorityError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            _ => Err(AuthorityError::Policy(format!(
                "pkcheck failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

/// Fixed answers per action id, for hosts without polkit.
#[derive(Debug, Clone)]
pub struct StaticAuthority {
    rules: HashMap<String, PolicyAnswer>,
    default_answer: PolicyAnswer,
}

impl StaticAuthority {
    pub fn new(rules: HashMap<String, PolicyAnswer>, default_answer: PolicyAnswer) -> Self {
        Self {
            rules,
            default_answer,
        }
    }
}

impl PolicyAuthority for StaticAuthority {
    fn name(&self) -> &str {
        "static"
    }

    fn check(&self, request: &AuthorizationRequest) -> Result<AuthorizationResult, AuthorityError> {
        let answer = self
            .rules
            .get(&request.action_id)
            .copied()
            .unwrap_or(self.default_answer);
        Ok(match answer {
            PolicyAnswer::Yes => AuthorizationResult::Authorized,
            PolicyAnswer::No => AuthorizationResult::NotAuthorized,
            PolicyAnswer::AuthAdmin if request.uid == ROOT_UID => AuthorizationResult::Authorized,
            PolicyAnswer::AuthAdmin => AuthorizationResult::Challenge,
        })
    }
}
