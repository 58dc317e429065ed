//! Object synchronization engine.
//!
//! ## `resync` — one pass
//!
//! 1. Collect wanted entities from every source (source filter applied).
//! 2. Diff the published keys against the wanted keys.
//! 3. Unpublish removals.
//! 4. Publish additions under a unique path; block wrappers take over any
//!    remembered child configuration.
//! 5. Refresh every entry that stayed published.
//! 6. Save the remembered-config store if the pass touched it.
//!
//! The engine is driven by `&mut self`, so passes can never overlap; callers
//! coalesce notifications that arrive while a pass is running.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use storaged_core::{ConfigStore, ObjectPath};

use crate::differ::diff_sorted_keys;
use crate::error::SyncError;
use crate::object_path::{base_path, uniquify};
use crate::upstream::{EntityKey, EntityKind, UpstreamEntity, UpstreamSource};

/// A locally published wrapper around one upstream entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedObject {
    pub path: ObjectPath,
    pub entity: UpstreamEntity,
    pub published_at: DateTime<Utc>,
    /// Configuration remembered for this object's children while it was gone.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remembered: Vec<serde_yaml::Value>,
}

/// What one pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: Vec<ObjectPath>,
    pub removed: Vec<ObjectPath>,
    /// Entries whose mirrored fields changed during the refresh step.
    pub refreshed: usize,
    /// Entries listed as wanted that were gone by the time they were wrapped.
    pub vanished: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.refreshed == 0
    }
}

pub struct SyncEngine {
    sources: Vec<Box<dyn UpstreamSource>>,
    published: BTreeMap<EntityKey, PublishedObject>,
    paths: BTreeMap<ObjectPath, EntityKey>,
    store: Option<Arc<dyn ConfigStore>>,
    passes: u64,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.origin()).collect::<Vec<_>>(),
            )
            .field("published", &self.published.len())
            .field("passes", &self.passes)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(sources: Vec<Box<dyn UpstreamSource>>) -> Self {
        Self {
            sources,
            published: BTreeMap::new(),
            paths: BTreeMap::new(),
            store: None,
            passes: 0,
        }
    }

    /// Attach the store that holds remembered child configuration.
    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn add_source(&mut self, source: Box<dyn UpstreamSource>) {
        self.sources.push(source);
    }

    /// Recompute the wanted set and apply the delta.
    ///
    /// The delta is applied even when saving the config store fails; the
    /// error is returned afterwards.
    pub fn resync(&mut self) -> Result<SyncReport, SyncError> {
        self.passes += 1;
        let mut report = SyncReport::default();

        let (wanted, failed_origins) = self.collect_wanted();

        let published_keys: Vec<EntityKey> = self.published.keys().cloned().collect();
        let wanted_keys: Vec<EntityKey> = wanted.into_iter().collect();
        let diff = diff_sorted_keys(&published_keys, &wanted_keys);

        for key in &diff.removed {
            if let Some(object) = self.published.remove(key) {
                self.paths.remove(&object.path);
                tracing::info!("unpublished {} ({}:{})", object.path, key.origin, key.id);
                report.removed.push(object.path);
            }
        }

        for key in &diff.added {
            let Some(source) = source_for(&self.sources, &key.origin) else {
                continue;
            };
            let entity = match source.fetch(key) {
                Ok(Some(entity)) if source.wants(&entity) => entity,
                Ok(Some(_)) => {
                    tracing::debug!("{}:{} stopped qualifying before it could be published", key.origin, key.id);
                    report.vanished += 1;
                    continue;
                }
                Ok(None) => {
                    tracing::debug!("{}:{} vanished before it could be published", key.origin, key.id);
                    report.vanished += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!("skipping {}:{}: {err}", key.origin, key.id);
                    report.vanished += 1;
                    continue;
                }
            };

            let path = uniquify(base_path(&entity.kind), |p| self.paths.contains_key(p));
            let remembered = match (&entity.kind, &self.store) {
                (EntityKind::Block { .. }, Some(store)) => store.take_remembered(&path),
                _ => Vec::new(),
            };
            if !remembered.is_empty() {
                tracing::info!("{path}: restored {} remembered config entries", remembered.len());
            }

            tracing::info!("published {path} ({}:{})", key.origin, key.id);
            self.paths.insert(path.clone(), key.clone());
            self.published.insert(
                key.clone(),
                PublishedObject {
                    path: path.clone(),
                    entity,
                    published_at: Utc::now(),
                    remembered,
                },
            );
            report.added.push(path);
        }

        for key in &diff.unchanged {
            if failed_origins.contains(&key.origin) {
                continue;
            }
            let Some(source) = source_for(&self.sources, &key.origin) else {
                continue;
            };
            let Some(object) = self.published.get_mut(key) else {
                continue;
            };
            match source.fetch(key) {
                Ok(Some(current)) if current != object.entity => {
                    tracing::debug!("refreshed {}", object.path);
                    object.entity = current;
                    report.refreshed += 1;
                }
                // Gone or unchanged; a later pass sees the removal.
                Ok(_) => {}
                Err(err) => tracing::warn!("refresh of {} failed: {err}", object.path),
            }
        }

        if let Some(store) = &self.store {
            store.save_if_dirty()?;
        }

        tracing::debug!(
            "sync pass {}: +{} -{} ~{}",
            self.passes,
            report.added.len(),
            report.removed.len(),
            report.refreshed
        );
        Ok(report)
    }

    /// Wanted keys across all sources. A source that fails to list keeps its
    /// current objects for this pass rather than losing all of them.
    fn collect_wanted(&self) -> (BTreeSet<EntityKey>, BTreeSet<String>) {
        let mut wanted = BTreeSet::new();
        let mut failed = BTreeSet::new();

        for source in &self.sources {
            let origin = source.origin();
            match source.snapshot() {
                Ok(entities) => {
                    for entity in entities {
                        if entity.key.origin != origin {
                            tracing::warn!(
                                "source {origin} listed foreign entity {}:{}",
                                entity.key.origin,
                                entity.key.id
                            );
                            continue;
                        }
                        if source.wants(&entity) {
                            wanted.insert(entity.key);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("listing {origin} failed, keeping its objects: {err}");
                    failed.insert(origin.to_string());
                    wanted.extend(self.published.keys().filter(|k| k.origin == origin).cloned());
                }
            }
        }
        (wanted, failed)
    }

    /// Published path for `key`, or the `/` sentinel when it has no wrapper.
    pub fn translate_path(&self, key: &EntityKey) -> ObjectPath {
        self.published
            .get(key)
            .map(|object| object.path.clone())
            .unwrap_or_else(ObjectPath::none)
    }

    /// [`Self::translate_path`] for an upstream id whose origin is unknown;
    /// sources are searched in registration order.
    pub fn translate_upstream_id(&self, id: Option<&str>) -> ObjectPath {
        let Some(id) = id else {
            return ObjectPath::none();
        };
        self.sources
            .iter()
            .map(|s| EntityKey::new(s.origin(), id))
            .find_map(|key| self.published.get(&key))
            .map(|object| object.path.clone())
            .unwrap_or_else(ObjectPath::none)
    }

    pub fn lookup(&self, path: &ObjectPath) -> Option<&PublishedObject> {
        self.paths.get(path).and_then(|key| self.published.get(key))
    }

    pub fn lookup_key(&self, key: &EntityKey) -> Option<&PublishedObject> {
        self.published.get(key)
    }

    /// Wrapper of the block device with device file `device`.
    pub fn lookup_block(&self, device: &str) -> Option<&PublishedObject> {
        self.published.values().find(
            |object| matches!(&object.entity.kind, EntityKind::Block { device: d, .. } if d == device),
        )
    }

    /// All wrappers, ordered by upstream key.
    pub fn objects(&self) -> impl Iterator<Item = &PublishedObject> {
        self.published.values()
    }

    pub fn len(&self) -> usize {
        self.published.len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.is_empty()
    }

    /// Number of passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes
    }
}

fn source_for<'a>(sources: &'a [Box<dyn UpstreamSource>], origin: &str) -> Option<&'a dyn UpstreamSource> {
    sources
        .iter()
        .find(|source| source.origin() == origin)
        .map(|source| source.as_ref())
}
