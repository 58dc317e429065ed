//! Caller credential resolution.
//!
//! The first time a peer is seen its uid is looked up asynchronously
//! through the [`PeerDirectory`]; a second task watches for the peer to
//! disconnect. Authorization runs on blocking threads and waits for the
//! lookup with [`CredentialResolver::resolve_blocking`], so the event loop
//! is never stalled by a slow bus.
//!
//! ```text
//! track(peer) ──► Pending ──lookup ok──► Resolved(uid)
//!                    └────lookup err──► Failed(msg)
//! peer vanishes ──► registration dropped, ClientEvent::Disappeared
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, Notify};

use storaged_core::{PeerId, Uid};

use crate::bus::PeerDirectory;
use crate::liveness::Liveness;

#[derive(Debug, Clone, PartialEq, Eq)]
enum UidState {
    Pending,
    Resolved(Uid),
    Failed(String),
}

#[derive(Debug)]
struct Registration {
    state: UidState,
    pid: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Appeared(PeerId),
    Disappeared(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Method call from unknown caller (internal error)")]
    UnknownCaller(PeerId),
    #[error("Error determining uid of caller {peer}: {message}")]
    ResolutionFailed { peer: PeerId, message: String },
    #[error("Timed out determining uid of caller {0}")]
    Timeout(PeerId),
}

pub struct CredentialResolver {
    bus: Arc<dyn PeerDirectory>,
    liveness: Arc<Liveness>,
    table: Mutex<HashMap<PeerId, Registration>>,
    settled: Condvar,
    settled_async: Notify,
    events: broadcast::Sender<ClientEvent>,
    timeout: Duration,
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("clients", &self.lock().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CredentialResolver {
    pub fn new(bus: Arc<dyn PeerDirectory>, liveness: Arc<Liveness>, timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            bus,
            liveness,
            table: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            settled_async: Notify::new(),
            events,
            timeout,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Start tracking `peer` if it is new. Never blocks; must be called from
    /// within the runtime.
    pub fn track(self: &Arc<Self>, peer: &PeerId) {
        {
            let mut table = self.lock();
            if table.contains_key(peer) {
                return;
            }
            table.insert(
                peer.clone(),
                Registration {
                    state: UidState::Pending,
                    pid: None,
                },
            );
        }
        self.liveness.client_appeared();
        tracing::debug!(peer = %peer, "client appeared");
        let _ = self.events.send(ClientEvent::Appeared(peer.clone()));

        let this = self.clone();
        let lookup_peer = peer.clone();
        tokio::spawn(async move {
            let result = this.bus.connection_unix_user(&lookup_peer).await;
            let mut table = this.lock();
            if let Some(reg) = table.get_mut(&lookup_peer) {
                match result {
                    Ok(creds) => {
                        reg.state = UidState::Resolved(creds.uid);
                        reg.pid = creds.pid;
                    }
                    Err(err) => {
                        tracing::warn!(peer = %lookup_peer, error = %err, "cannot resolve caller uid");
                        reg.state = UidState::Failed(err.to_string());
                    }
                }
            }
            drop(table);
            this.settled.notify_all();
            this.settled_async.notify_waiters();
        });

        let this = self.clone();
        let watched = peer.clone();
        tokio::spawn(async move {
            this.bus.wait_vanished(&watched).await;
            this.forget(&watched);
        });
    }

    fn forget(&self, peer: &PeerId) {
        if self.lock().remove(peer).is_none() {
            return;
        }
        // Anyone still waiting on this peer must not wait for the timeout.
        self.settled.notify_all();
        self.settled_async.notify_waiters();
        self.liveness.client_disappeared();
        tracing::debug!(peer = %peer, "client disappeared");
        let _ = self.events.send(ClientEvent::Disappeared(peer.clone()));
    }

    /// Wait for `peer`'s uid on the current (blocking) thread.
    pub fn resolve_blocking(&self, peer: &PeerId) -> Result<Uid, CredentialError> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.lock();
        loop {
            match settle(&table, peer) {
                Some(result) => return result,
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CredentialError::Timeout(peer.clone()));
                    }
                    let (guard, _) = self
                        .settled
                        .wait_timeout(table, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    table = guard;
                }
            }
        }
    }

    /// Async flavour of [`Self::resolve_blocking`].
    pub async fn resolve(&self, peer: &PeerId) -> Result<Uid, CredentialError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let notified = self.settled_async.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let settled = settle(&self.lock(), peer);
            if let Some(result) = settled {
                return result;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(CredentialError::Timeout(peer.clone()));
            }
        }
    }

    /// Process id reported for `peer`, once resolved.
    pub fn peer_pid(&self, peer: &PeerId) -> Option<i32> {
        self.lock().get(peer).and_then(|reg| reg.pid)
    }

    pub fn is_tracked(&self, peer: &PeerId) -> bool {
        self.lock().contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Registration>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `None` while the lookup is still running.
fn settle(
    table: &HashMap<PeerId, Registration>,
    peer: &PeerId,
) -> Option<Result<Uid, CredentialError>> {
    match table.get(peer).map(|reg| &reg.state) {
        None => Some(Err(CredentialError::UnknownCaller(peer.clone()))),
        Some(UidState::Pending) => None,
        Some(UidState::Resolved(uid)) => Some(Ok(*uid)),
        Some(UidState::Failed(message)) => Some(Err(CredentialError::ResolutionFailed {
            peer: peer.clone(),
            message: message.clone(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::*;
    use crate::bus::PeerCredentials;
    use crate::error::BusError;

    /// Directory whose answers are released by the test.
    struct Scripted {
        release: watch::Receiver<bool>,
        gone: watch::Receiver<bool>,
        uid: Option<Uid>,
    }

    #[async_trait]
    impl PeerDirectory for Scripted {
        async fn connection_unix_user(&self, peer: &PeerId) -> Result<PeerCredentials, BusError> {
            let mut release = self.release.clone();
            let _ = release.wait_for(|go| *go).await;
            self.uid
                .map(|uid| PeerCredentials { uid, pid: Some(7) })
                .ok_or_else(|| BusError::NoCredentials(peer.clone()))
        }

        async fn wait_vanished(&self, _peer: &PeerId) {
            let mut gone = self.gone.clone();
            let _ = gone.wait_for(|g| *g).await;
        }
    }

    struct Harness {
        resolver: Arc<CredentialResolver>,
        liveness: Arc<Liveness>,
        release: watch::Sender<bool>,
        gone: watch::Sender<bool>,
    }

    fn harness(uid: Option<Uid>) -> Harness {
        let (release, release_rx) = watch::channel(false);
        let (gone, gone_rx) = watch::channel(false);
        let liveness = Arc::new(Liveness::new(false));
        let resolver = CredentialResolver::new(
            Arc::new(Scripted {
                release: release_rx,
                gone: gone_rx,
                uid,
            }),
            liveness.clone(),
            Duration::from_secs(5),
        );
        Harness {
            resolver,
            liveness,
            release,
            gone,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_waiter_sees_late_resolution() {
        let h = harness(Some(1000));
        let peer = PeerId::from(":1.1");
        h.resolver.track(&peer);

        let waiter = {
            let resolver = h.resolver.clone();
            let peer = peer.clone();
            tokio::task::spawn_blocking(move || resolver.resolve_blocking(&peer))
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "must wait while pending");

        h.release.send_replace(true);
        assert_eq!(waiter.await.expect("join"), Ok(1000));
        assert_eq!(h.resolver.peer_pid(&peer), Some(7));
    }

    #[tokio::test]
    async fn unknown_caller_is_an_internal_error() {
        let h = harness(Some(1000));
        let err = h.resolver.resolve(&PeerId::from(":1.9")).await.unwrap_err();
        assert_eq!(err.to_string(), "Method call from unknown caller (internal error)");
    }

    #[tokio::test]
    async fn failed_lookup_is_reported() {
        let h = harness(None);
        let peer = PeerId::from(":1.2");
        h.resolver.track(&peer);
        h.release.send_replace(true);
        let err = h.resolver.resolve(&peer).await.unwrap_err();
        assert!(matches!(err, CredentialError::ResolutionFailed { .. }), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn pending_lookup_times_out() {
        let h = harness(Some(1));
        let peer = PeerId::from(":1.3");
        h.resolver.track(&peer);
        let err = h.resolver.resolve(&peer).await.unwrap_err();
        assert_eq!(err, CredentialError::Timeout(peer));
    }

    #[tokio::test]
    async fn vanish_drops_registration_and_emits_events() {
        let h = harness(Some(1000));
        let mut events = h.resolver.subscribe();
        let peer = PeerId::from(":1.4");

        h.resolver.track(&peer);
        h.resolver.track(&peer);
        assert_eq!(events.recv().await.expect("event"), ClientEvent::Appeared(peer.clone()));
        assert_eq!(h.liveness.snapshot().clients, 1, "tracked once");

        h.gone.send_replace(true);
        assert_eq!(
            events.recv().await.expect("event"),
            ClientEvent::Disappeared(peer.clone())
        );
        assert!(!h.resolver.is_tracked(&peer));
        assert_eq!(h.liveness.snapshot().clients, 0);
    }
}
