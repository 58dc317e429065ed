//! Published object path generation.
//!
//! ```text
//! /org/storaged/Storage/block_devices/<device without /dev/>
//! /org/storaged/Storage/drives/<vendor>_<model>_<revision>_<serial>
//! /org/storaged/Storage/raids/<uuid>
//! /org/storaged/Storage/lvm/<vg>
//! /org/storaged/Storage/lvm/<vg>/<lv>
//! /org/storaged/Storage/jobs/<operation>
//! ```

use storaged_core::{escape_segment, ObjectPath};

use crate::upstream::EntityKind;

pub const STORAGE_ROOT: &str = "/org/storaged/Storage";

/// Preferred path for a wrapper of `kind`, before collision handling.
pub fn base_path(kind: &EntityKind) -> ObjectPath {
    let root = ObjectPath::from(STORAGE_ROOT);
    match kind {
        EntityKind::Block { device, .. } => {
            let name = device.strip_prefix("/dev/").unwrap_or(device);
            root.child("block_devices").child(name)
        }
        EntityKind::Drive {
            vendor,
            model,
            revision,
            serial,
        } => {
            let parts: Vec<String> = [vendor, model, revision, serial]
                .into_iter()
                .filter(|p| !p.is_empty())
                .map(|p| escape_segment(p))
                .collect();
            let name = if parts.is_empty() {
                "drive".to_string()
            } else {
                parts.join("_")
            };
            ObjectPath(format!("{}/drives/{name}", STORAGE_ROOT))
        }
        EntityKind::MdRaid { uuid, .. } => root.child("raids").child(uuid),
        EntityKind::VolumeGroup { name } => root.child("lvm").child(name),
        EntityKind::LogicalVolume { volume_group, name } => {
            root.child("lvm").child(volume_group).child(name)
        }
        EntityKind::Job { operation } => root.child("jobs").child(operation),
    }
}

/// First of `base`, `base_1`, `base_2`, … that `taken` rejects.
pub fn uniquify(base: ObjectPath, taken: impl Fn(&ObjectPath) -> bool) -> ObjectPath {
    if !taken(&base) {
        return base;
    }
    (1u64..)
        .map(|n| ObjectPath(format!("{}_{n}", base.0)))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}
