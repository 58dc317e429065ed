use std::path::PathBuf;

use thiserror::Error;

use storaged_core::PeerId;

/// Error surface for the daemon runtime and its client protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Core(#[from] storaged_core::CoreError),

    #[error("sync error: {0}")]
    Sync(#[from] storaged_sync::SyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },

    #[error(transparent)]
    Method(#[from] MethodError),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

pub const ERROR_DOMAIN: &str = "org.storaged.Error";

/// Error returned to a caller of a published method.
///
/// Each variant has a stable wire name under [`ERROR_DOMAIN`] so clients can
/// tell an authorization failure from a failed operation without parsing
/// the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodError {
    #[error("{0}")]
    NotAuthorized(String),
    #[error("{0}")]
    NotAuthorizedCanObtain(String),
    #[error("{0}")]
    NotAuthorizedDismissed(String),
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    AlreadyCancelled(String),
    #[error("{0}")]
    Cancelled(String),
    #[error("{0}")]
    UnknownMethod(String),
    #[error("{0}")]
    UnknownObject(String),
    #[error("{0}")]
    InvalidArgs(String),
}

impl MethodError {
    /// Fully qualified name, e.g. `org.storaged.Error.NotAuthorized`.
    pub fn name(&self) -> String {
        let short = match self {
            MethodError::NotAuthorized(_) => "NotAuthorized",
            MethodError::NotAuthorizedCanObtain(_) => "NotAuthorizedCanObtain",
            MethodError::NotAuthorizedDismissed(_) => "NotAuthorizedDismissed",
            MethodError::Failed(_) => "Failed",
            MethodError::AlreadyCancelled(_) => "AlreadyCancelled",
            MethodError::Cancelled(_) => "Cancelled",
            MethodError::UnknownMethod(_) => "UnknownMethod",
            MethodError::UnknownObject(_) => "UnknownObject",
            MethodError::InvalidArgs(_) => "InvalidArgs",
        };
        format!("{ERROR_DOMAIN}.{short}")
    }

    pub fn message(&self) -> &str {
        match self {
            MethodError::NotAuthorized(m)
            | MethodError::NotAuthorizedCanObtain(m)
            | MethodError::NotAuthorizedDismissed(m)
            | MethodError::Failed(m)
            | MethodError::AlreadyCancelled(m)
            | MethodError::Cancelled(m)
            | MethodError::UnknownMethod(m)
            | MethodError::UnknownObject(m)
            | MethodError::InvalidArgs(m) => m,
        }
    }

    /// Rebuild an error from its wire name; unknown names become `Failed`.
    pub fn from_wire(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let short = name.strip_prefix(ERROR_DOMAIN).and_then(|s| s.strip_prefix('.'));
        match short {
            Some("NotAuthorized") => MethodError::NotAuthorized(message),
            Some("NotAuthorizedCanObtain") => MethodError::NotAuthorizedCanObtain(message),
            Some("NotAuthorizedDismissed") => MethodError::NotAuthorizedDismissed(message),
            Some("AlreadyCancelled") => MethodError::AlreadyCancelled(message),
            Some("Cancelled") => MethodError::Cancelled(message),
            Some("UnknownMethod") => MethodError::UnknownMethod(message),
            Some("UnknownObject") => MethodError::UnknownObject(message),
            Some("InvalidArgs") => MethodError::InvalidArgs(message),
            _ => MethodError::Failed(message),
        }
    }

    /// Whether the caller was turned away by the authorization layer.
    pub fn is_not_authorized(&self) -> bool {
        matches!(
            self,
            MethodError::NotAuthorized(_)
                | MethodError::NotAuthorizedCanObtain(_)
                | MethodError::NotAuthorizedDismissed(_)
        )
    }
}

/// Failure of the bus while answering a question about a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("no credentials available for peer {0}")]
    NoCredentials(PeerId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        let err = MethodError::NotAuthorizedDismissed("The authentication dialog was dismissed".into());
        assert_eq!(err.name(), "org.storaged.Error.NotAuthorizedDismissed");
        assert_eq!(MethodError::from_wire(&err.name(), err.message()), err);
    }

    #[test]
    fn unknown_wire_name_is_failed() {
        let err = MethodError::from_wire("com.example.Weird", "boom");
        assert_eq!(err, MethodError::Failed("boom".into()));
        assert!(!err.is_not_authorized());
    }
}
