//! Daemon context shared by every transport task and method handler.
//!
//! Building a [`Daemon`] starts its sync processor: the single task that
//! runs engine passes. Triggers arriving while a pass runs are coalesced
//! into the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use storaged_core::{DaemonConfig, ObjectPath, RememberedConfigs};
use storaged_sync::{PublishedObject, SyncEngine, SyncReport, SysfsSource, UpstreamSource};

use crate::authority::{self, PolicyAuthority};
use crate::authorize::{Authorizer, PolicyTable};
use crate::bus::PeerDirectory;
use crate::credentials::CredentialResolver;
use crate::error::{DaemonError, MethodError};
use crate::jobs::{JobEvent, JobRegistry};
use crate::liveness::Liveness;

/// A published object appeared or went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "path", rename_all = "snake_case")]
pub enum ObjectEvent {
    Added(ObjectPath),
    Removed(ObjectPath),
}

struct SyncRequest {
    source: &'static str,
    respond_to: Option<oneshot::Sender<Result<SyncReport, String>>>,
}

pub struct DaemonBuilder {
    config: DaemonConfig,
    sources: Vec<Box<dyn UpstreamSource>>,
    authority: Option<Option<Arc<dyn PolicyAuthority>>>,
    policies: PolicyTable,
}

impl DaemonBuilder {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            authority: None,
            policies: PolicyTable::builtin(),
        }
    }

    pub fn source(mut self, source: Box<dyn UpstreamSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Override the authority named in the config; `None` means no authority.
    pub fn authority(mut self, authority: Option<Arc<dyn PolicyAuthority>>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Assemble the daemon and start its sync processor. Must be called
    /// from within the runtime.
    pub fn build(self, peers: Arc<dyn PeerDirectory>) -> Result<Arc<Daemon>, DaemonError> {
        let config = self.config;
        let store = Arc::new(RememberedConfigs::load_at(&config.remembered_configs_path())?);
        let engine = SyncEngine::new(self.sources).with_config_store(store);

        let liveness = Arc::new(Liveness::new(config.persist));
        let resolver = CredentialResolver::new(peers, liveness.clone(), config.resolve_timeout());
        let authority = self
            .authority
            .unwrap_or_else(|| authority::from_config(&config.authority));
        let authorizer = Arc::new(Authorizer::new(resolver.clone(), authority, self.policies));
        let jobs = JobRegistry::new(liveness.clone());

        let (sync_tx, sync_rx) = mpsc::channel(64);
        let (objects, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(16);

        let daemon = Arc::new(Daemon {
            config,
            started_at: Utc::now(),
            liveness,
            resolver,
            authorizer,
            jobs,
            engine: Arc::new(Mutex::new(engine)),
            objects,
            sync_tx,
            shutdown,
        });

        tokio::spawn(sync_processor_task(
            daemon.engine.clone(),
            daemon.objects.clone(),
            sync_rx,
            daemon.jobs.subscribe(),
            daemon.shutdown.subscribe(),
        ));
        tracing::info!(
            persist = daemon.config.persist,
            authority = daemon.authorizer.authority_name(),
            "daemon context ready",
        );
        Ok(daemon)
    }
}

pub struct Daemon {
    config: DaemonConfig,
    started_at: DateTime<Utc>,
    liveness: Arc<Liveness>,
    resolver: Arc<CredentialResolver>,
    authorizer: Arc<Authorizer>,
    jobs: Arc<JobRegistry>,
    engine: Arc<Mutex<SyncEngine>>,
    objects: broadcast::Sender<ObjectEvent>,
    sync_tx: mpsc::Sender<SyncRequest>,
    shutdown: broadcast::Sender<()>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("liveness", &self.liveness.snapshot())
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

impl Daemon {
    /// Daemon backed by the sysfs tree and authority named in `config`.
    pub fn from_config(config: DaemonConfig, peers: Arc<dyn PeerDirectory>) -> Result<Arc<Self>, DaemonError> {
        let sysfs = SysfsSource::new(&config.sysfs_root);
        DaemonBuilder::new(config).source(Box::new(sysfs)).build(peers)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    pub fn resolver(&self) -> &Arc<CredentialResolver> {
        &self.resolver
    }

    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn subscribe_objects(&self) -> broadcast::Receiver<ObjectEvent> {
        self.objects.subscribe()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Run a pass and wait for its report.
    pub async fn resync(&self, source: &'static str) -> Result<SyncReport, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.sync_tx
            .send(SyncRequest {
                source,
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;
        let outcome = rx
            .await
            .map_err(|_| DaemonError::ChannelClosed("sync response"))?;
        outcome.map_err(DaemonError::Protocol)
    }

    /// Ask for a pass without waiting for it.
    pub fn request_resync(&self, source: &'static str) {
        let request = SyncRequest {
            source,
            respond_to: None,
        };
        // A full queue already holds a pass that will see this change.
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.sync_tx.try_send(request) {
            tracing::debug!(source, "sync queue closed; dropping trigger");
        }
    }

    pub async fn objects(&self) -> Vec<PublishedObject> {
        self.engine.lock().await.objects().cloned().collect()
    }

    pub async fn lookup(&self, path: &ObjectPath) -> Option<PublishedObject> {
        self.engine.lock().await.lookup(path).cloned()
    }

    /// Wait until a published object satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Result<PublishedObject, MethodError>
    where
        F: Fn(&PublishedObject) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = self.objects.subscribe();
        loop {
            let found = self.engine.lock().await.objects().find(|o| predicate(o)).cloned();
            if let Some(object) = found {
                return Ok(object);
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    return Err(MethodError::Failed(
                        "Timed out waiting for object".to_string(),
                    ))
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(MethodError::Failed("Daemon is shutting down".to_string()))
                }
                Ok(_) => {}
            }
        }
    }

    pub async fn wait_for_object(&self, path: &ObjectPath, timeout: Duration) -> Result<PublishedObject, MethodError> {
        self.wait_for(|object| &object.path == path, timeout).await
    }

    pub async fn status(&self) -> Value {
        let (objects, passes) = {
            let engine = self.engine.lock().await;
            (engine.len(), engine.passes())
        };
        json!({
            "running": true,
            "started_at": self.started_at,
            "liveness": self.liveness.snapshot(),
            "objects": objects,
            "passes": passes,
            "jobs": self.jobs.len(),
            "authority": self.authorizer.authority_name(),
            "socket": self.config.socket_path.display().to_string(),
        })
    }
}

async fn sync_processor_task(
    engine: Arc<Mutex<SyncEngine>>,
    objects: broadcast::Sender<ObjectEvent>,
    mut sync_rx: mpsc::Receiver<SyncRequest>,
    mut job_events: broadcast::Receiver<JobEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    if let Err(err) = run_pass(&engine, &objects, "startup").await {
        tracing::error!(error = %err, "initial sync failed");
    }

    loop {
        let mut responders = Vec::new();
        let source = tokio::select! {
            _ = shutdown_rx.recv() => break,
            request = sync_rx.recv() => {
                let Some(request) = request else { break };
                responders.extend(request.respond_to);
                request.source
            }
            event = job_events.recv() => match event {
                Ok(JobEvent::Completed { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => "job",
                Ok(JobEvent::Launched { .. }) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        // Everything queued so far is answered by this one pass.
        let mut coalesced = 0usize;
        while let Ok(request) = sync_rx.try_recv() {
            responders.extend(request.respond_to);
            coalesced += 1;
        }
        if coalesced > 0 {
            tracing::debug!(source, coalesced, "coalesced sync triggers");
        }

        let outcome = run_pass(&engine, &objects, source).await;
        if let Err(err) = &outcome {
            tracing::error!(source, error = %err, "sync pass failed");
        }
        for responder in responders {
            let _ = responder.send(outcome.clone());
        }
    }
}

async fn run_pass(
    engine: &Arc<Mutex<SyncEngine>>,
    objects: &broadcast::Sender<ObjectEvent>,
    source: &'static str,
) -> Result<SyncReport, String> {
    let engine = engine.clone();
    let started = tokio::time::Instant::now();
    let report = tokio::task::spawn_blocking(move || engine.blocking_lock().resync())
        .await
        .map_err(|err| format!("sync task join error: {err}"))?
        .map_err(|err| err.to_string())?;

    for path in &report.removed {
        let _ = objects.send(ObjectEvent::Removed(path.clone()));
    }
    for path in &report.added {
        let _ = objects.send(ObjectEvent::Added(path.clone()));
    }
    if !report.is_noop() {
        tracing::info!(
            source,
            added = report.added.len(),
            removed = report.removed.len(),
            refreshed = report.refreshed,
            duration_ms = started.elapsed().as_millis() as u64,
            "objects synchronized",
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex as StdMutex};

    use storaged_sync::{EntityKey, SyncError, UpstreamEntity};
    use tempfile::TempDir;

    use super::*;
    use crate::bus::SocketPeers;

    /// Listing parks until the gate is opened.
    #[derive(Default)]
    struct Gate {
        listings: AtomicUsize,
        open: StdMutex<bool>,
        opened: Condvar,
    }

    impl Gate {
        fn open(&self) {
            *self.open.lock().expect("gate lock") = true;
            self.opened.notify_all();
        }

        fn listings(&self) -> usize {
            self.listings.load(Ordering::SeqCst)
        }

        async fn wait_for_listings(&self, n: usize) {
            for _ in 0..500 {
                if self.listings() >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("listing {n} never started");
        }
    }

    struct GatedSource(Arc<Gate>);

    impl UpstreamSource for GatedSource {
        fn origin(&self) -> &str {
            "gated"
        }

        fn snapshot(&self) -> Result<Vec<UpstreamEntity>, SyncError> {
            self.0.listings.fetch_add(1, Ordering::SeqCst);
            let mut open = self.0.open.lock().expect("gate lock");
            while !*open {
                open = self.0.opened.wait(open).expect("gate lock");
            }
            Ok(Vec::new())
        }

        fn fetch(&self, _key: &EntityKey) -> Result<Option<UpstreamEntity>, SyncError> {
            Ok(None)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn triggers_during_a_pass_are_coalesced_into_one() {
        let dir = TempDir::new().expect("tempdir");
        let gate = Arc::new(Gate::default());
        let config = DaemonConfig {
            state_dir: dir.path().join("state"),
            ..DaemonConfig::default()
        };
        let daemon = DaemonBuilder::new(config)
            .source(Box::new(GatedSource(gate.clone())))
            .authority(None)
            .build(Arc::new(SocketPeers::new()))
            .expect("daemon builds");

        // Startup pass is now held inside the listing.
        gate.wait_for_listings(1).await;
        for _ in 0..3 {
            daemon.request_resync("test");
        }
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let daemon = daemon.clone();
                tokio::spawn(async move { daemon.resync("test").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gate.listings(), 1, "no second pass may start while one runs");
        gate.open();

        for waiter in waiters {
            let report = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("resync answered")
                .expect("join")
                .expect("report");
            assert!(report.is_noop());
        }
        assert_eq!(daemon.engine.lock().await.passes(), 2);
        assert_eq!(gate.listings(), 2);
    }
}
