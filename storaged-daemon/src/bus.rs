//! Message-bus seam.
//!
//! The daemon only needs two things from its transport: who owns a
//! connection, and when that connection goes away. [`PeerDirectory`]
//! captures exactly that, so the credential resolver can be driven by the
//! Unix socket server in production and by a scripted directory in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use storaged_core::{ObjectPath, PeerId, Uid};

use crate::error::BusError;
use crate::paths::NO_USER_INTERACTION_OPTION;

/// One inbound method call as routed by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub object: ObjectPath,
    pub interface: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

impl MethodCall {
    pub fn new(object: impl Into<ObjectPath>, interface: &str, method: &str) -> Self {
        Self {
            object: object.into(),
            interface: interface.to_string(),
            method: method.to_string(),
            args: Value::Null,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// The `options` map every method accepts, if present.
    pub fn options(&self) -> Option<&Map<String, Value>> {
        self.args.get("options")?.as_object()
    }

    /// Whether the caller asked not to be prompted for authentication.
    pub fn no_user_interaction(&self) -> bool {
        self.options()
            .and_then(|o| o.get(NO_USER_INTERACTION_OPTION))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `interface.method`, for logs.
    pub fn member(&self) -> String {
        format!("{}.{}", self.interface, self.method)
    }
}

/// What the bus reports about a connection's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: Uid,
    pub pid: Option<i32>,
}

#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Ask the bus which OS user owns `peer`'s connection.
    async fn connection_unix_user(&self, peer: &PeerId) -> Result<PeerCredentials, BusError>;

    /// Resolves once `peer` has disconnected. Unknown peers count as gone.
    async fn wait_vanished(&self, peer: &PeerId);
}

struct SocketPeer {
    credentials: Option<PeerCredentials>,
    alive: watch::Sender<bool>,
}

/// Peer table fed by the Unix socket server.
///
/// Credentials come from `SO_PEERCRED` at accept time; each accepted
/// connection gets a fresh unique name in the `:1.N` style.
#[derive(Default)]
pub struct SocketPeers {
    next: AtomicU64,
    peers: Mutex<HashMap<PeerId, SocketPeer>>,
}

impl SocketPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection.
    pub fn connect(&self, credentials: Option<PeerCredentials>) -> PeerId {
        let id = PeerId(format!(":1.{}", self.next.fetch_add(1, Ordering::Relaxed)));
        let (alive, _) = watch::channel(true);
        self.lock().insert(id.clone(), SocketPeer { credentials, alive });
        id
    }

    pub fn disconnect(&self, peer: &PeerId) {
        if let Some(entry) = self.lock().remove(peer) {
            entry.alive.send_replace(false);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, SocketPeer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PeerDirectory for SocketPeers {
    async fn connection_unix_user(&self, peer: &PeerId) -> Result<PeerCredentials, BusError> {
        let peers = self.lock();
        let entry = peers
            .get(peer)
            .ok_or_else(|| BusError::UnknownPeer(peer.clone()))?;
        entry
            .credentials
            .ok_or_else(|| BusError::NoCredentials(peer.clone()))
    }

    async fn wait_vanished(&self, peer: &PeerId) {
        let mut rx = match self.lock().get(peer) {
            Some(entry) => entry.alive.subscribe(),
            None => return,
        };
        // A dropped sender also means the peer is gone.
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn no_user_interaction_reads_options() {
        let call = MethodCall::new("/org/storaged/jobs/0", "org.storaged.Job", "Cancel")
            .with_args(json!({"options": {"auth.no_user_interaction": true}}));
        assert!(call.no_user_interaction());
        let plain = MethodCall::new("/", "org.storaged.Manager", "Status");
        assert!(!plain.no_user_interaction());
        assert_eq!(plain.member(), "org.storaged.Manager.Status");
    }

    #[tokio::test]
    async fn socket_peer_reports_credentials_until_disconnect() {
        let peers = Arc::new(SocketPeers::new());
        let peer = peers.connect(Some(PeerCredentials { uid: 1000, pid: Some(42) }));
        let anonymous = peers.connect(None);

        let creds = peers.connection_unix_user(&peer).await.expect("creds");
        assert_eq!(creds.uid, 1000);
        assert_eq!(
            peers.connection_unix_user(&anonymous).await,
            Err(BusError::NoCredentials(anonymous.clone()))
        );

        let waiter = {
            let peers = peers.clone();
            let peer = peer.clone();
            tokio::spawn(async move { peers.wait_vanished(&peer).await })
        };
        peers.disconnect(&peer);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("vanish observed")
            .expect("join");
        assert_eq!(
            peers.connection_unix_user(&peer).await,
            Err(BusError::UnknownPeer(peer.clone()))
        );
        assert_eq!(peers.len(), 1);
    }
}
