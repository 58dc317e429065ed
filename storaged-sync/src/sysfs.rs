//! Upstream source backed by the kernel's sysfs tree.
//!
//! ```text
//! <root>/class/block/<name>/
//!   size                 (512-byte sectors)
//!   partition            (present for partitions)
//!   device/{vendor,model,rev,serial}
//!   md/uuid              (present for MD arrays)
//! ```
//!
//! Every block entry yields a `block:<name>` entity; whole disks with a
//! `device` link also yield a `drive:<name>` entity and MD arrays a
//! `raid:<uuid>` entity. Entries that vanish while being read are skipped.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{io_err, SyncError};
use crate::upstream::{EntityKey, EntityKind, UpstreamEntity, UpstreamSource};

pub const SYSFS_ORIGIN: &str = "sysfs";

const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone)]
pub struct SysfsSource {
    root: PathBuf,
}

impl SysfsSource {
    /// `root` is the sysfs mount point, normally `/sys`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn class_block(&self) -> PathBuf {
        self.root.join("class").join("block")
    }

    fn block_names(&self) -> Result<Vec<String>, SyncError> {
        let dir = self.class_block();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&dir, err)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read_block(&self, name: &str) -> Result<Option<UpstreamEntity>, SyncError> {
        let dir = self.class_block().join(name);
        let Some(sectors) = read_attr(&dir.join("size"))? else {
            return Ok(None);
        };
        let size = sectors.parse::<u64>().unwrap_or(0) * SECTOR_SIZE;
        Ok(Some(UpstreamEntity {
            key: EntityKey::new(SYSFS_ORIGIN, format!("block:{name}")),
            kind: EntityKind::Block {
                // sysfs spells nested device nodes with '!', e.g. cciss!c0d0
                device: format!("/dev/{}", name.replace('!', "/")),
                size,
            },
        }))
    }

    fn read_drive(&self, name: &str) -> Result<Option<UpstreamEntity>, SyncError> {
        let dir = self.class_block().join(name);
        let device = dir.join("device");
        if !device.exists() || dir.join("partition").exists() {
            return Ok(None);
        }
        let attr = |file: &str| -> Result<String, SyncError> {
            Ok(read_attr(&device.join(file))?.unwrap_or_default())
        };
        Ok(Some(UpstreamEntity {
            key: EntityKey::new(SYSFS_ORIGIN, format!("drive:{name}")),
            kind: EntityKind::Drive {
                vendor: attr("vendor")?,
                model: attr("model")?,
                revision: attr("rev")?,
                serial: attr("serial")?,
            },
        }))
    }

    fn read_raid_of(&self, name: &str) -> Result<Option<UpstreamEntity>, SyncError> {
        let Some(uuid) = read_attr(&self.class_block().join(name).join("md").join("uuid"))? else {
            return Ok(None);
        };
        if uuid.is_empty() {
            return Ok(None);
        }
        Ok(Some(UpstreamEntity {
            key: EntityKey::new(SYSFS_ORIGIN, format!("raid:{uuid}")),
            kind: EntityKind::MdRaid {
                uuid,
                name: name.to_string(),
            },
        }))
    }
}

impl UpstreamSource for SysfsSource {
    fn origin(&self) -> &str {
        SYSFS_ORIGIN
    }

    fn snapshot(&self) -> Result<Vec<UpstreamEntity>, SyncError> {
        let mut out = Vec::new();
        for name in self.block_names()? {
            out.extend(self.read_block(&name)?);
            out.extend(self.read_drive(&name)?);
            out.extend(self.read_raid_of(&name)?);
        }
        Ok(out)
    }

    fn fetch(&self, key: &EntityKey) -> Result<Option<UpstreamEntity>, SyncError> {
        if key.origin != SYSFS_ORIGIN {
            return Ok(None);
        }
        match key.id.split_once(':') {
            Some(("block", name)) => self.read_block(name),
            Some(("drive", name)) => self.read_drive(name),
            Some(("raid", uuid)) => {
                for name in self.block_names()? {
                    if let Some(raid) = self.read_raid_of(&name)? {
                        if matches!(&raid.kind, EntityKind::MdRaid { uuid: u, .. } if u == uuid) {
                            return Ok(Some(raid));
                        }
                    }
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

/// Read a sysfs attribute, trimmed. A missing file is `None`.
fn read_attr(path: &Path) -> Result<Option<String>, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}
