//! Upstream entity model and sources.
//!
//! An upstream source is anything that owns storage state the daemon mirrors:
//! the kernel's sysfs tree, an LVM service, or an in-memory table in tests.
//! Entities are compared by their [`EntityKey`] only; content changes are
//! picked up by refreshing, never by replacing the wrapper.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Upstream jobs worth mirroring; everything else is an implementation detail
/// of the upstream service.
pub const MIRRORED_JOB_OPERATIONS: &[&str] = &["format-mkfs", "format-erase", "lvm-vg-empty-device"];

/// Stable identity of one upstream entity. Ordered by origin, then id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub origin: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(origin: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            id: id.into(),
        }
    }
}

/// The kind-specific fields mirrored for an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    Block {
        /// Device file, e.g. `/dev/sda1`.
        device: String,
        /// Size in bytes.
        size: u64,
    },
    Drive {
        vendor: String,
        model: String,
        revision: String,
        serial: String,
    },
    MdRaid {
        uuid: String,
        name: String,
    },
    VolumeGroup {
        name: String,
    },
    LogicalVolume {
        volume_group: String,
        name: String,
    },
    /// A long-running operation owned by the upstream service.
    Job {
        operation: String,
    },
}

/// One upstream entity as seen at listing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamEntity {
    pub key: EntityKey,
    #[serde(flatten)]
    pub kind: EntityKind,
}

/// Whether an entity deserves a published wrapper.
///
/// Unused loop and nbd devices (size 0) are skipped, and only the upstream
/// jobs named in [`MIRRORED_JOB_OPERATIONS`] are kept.
pub fn default_wants(entity: &UpstreamEntity) -> bool {
    match &entity.kind {
        EntityKind::Block { device, size } => {
            !(*size == 0 && (device.starts_with("/dev/loop") || device.starts_with("/dev/nbd")))
        }
        EntityKind::Job { operation } => MIRRORED_JOB_OPERATIONS.contains(&operation.as_str()),
        _ => true,
    }
}

/// A set of upstream entities the engine reconciles against.
pub trait UpstreamSource: Send + Sync {
    /// Name used as [`EntityKey::origin`] for every entity of this source.
    fn origin(&self) -> &str;

    /// Every entity currently known to the source.
    fn snapshot(&self) -> Result<Vec<UpstreamEntity>, SyncError>;

    /// Current state of one entity. `Ok(None)` means it vanished since it was
    /// listed, which is expected while devices come and go.
    fn fetch(&self, key: &EntityKey) -> Result<Option<UpstreamEntity>, SyncError>;

    /// Source-specific filter applied to [`UpstreamSource::snapshot`] and to
    /// freshly fetched entities before they are published.
    fn wants(&self, entity: &UpstreamEntity) -> bool {
        default_wants(entity)
    }
}

/// Shared in-memory source. Clones see the same table.
#[derive(Debug, Clone)]
pub struct MemorySource {
    origin: String,
    entities: Arc<Mutex<Vec<UpstreamEntity>>>,
}

impl MemorySource {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            entities: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Insert or replace the entity with id `id`.
    pub fn upsert(&self, id: impl Into<String>, kind: EntityKind) {
        let key = EntityKey::new(self.origin.clone(), id);
        let mut entities = self.lock();
        match entities.iter_mut().find(|e| e.key == key) {
            Some(existing) => existing.kind = kind,
            None => entities.push(UpstreamEntity { key, kind }),
        }
    }

    /// Remove the entity with id `id`; returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let mut entities = self.lock();
        let before = entities.len();
        entities.retain(|e| e.key.id != id);
        entities.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UpstreamEntity>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UpstreamSource for MemorySource {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn snapshot(&self) -> Result<Vec<UpstreamEntity>, SyncError> {
        Ok(self.lock().clone())
    }

    fn fetch(&self, key: &EntityKey) -> Result<Option<UpstreamEntity>, SyncError> {
        Ok(self.lock().iter().find(|e| &e.key == key).cloned())
    }
}
