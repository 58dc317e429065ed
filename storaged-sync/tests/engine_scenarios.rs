use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use storaged_core::{ObjectPath, RememberedConfigs};
use storaged_sync::{EntityKey, EntityKind, MemorySource, SyncEngine, SysfsSource, UpstreamSource};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn block(device: &str) -> EntityKind {
    EntityKind::Block {
        device: device.to_string(),
        size: 4096,
    }
}

#[test]
fn back_to_back_passes_with_unchanged_upstream_are_noops() {
    init_logging();
    let source = MemorySource::new("udisks");
    source.upsert("/udisks/sda", block("/dev/sda"));
    source.upsert(
        "/udisks/drive0",
        EntityKind::Drive {
            vendor: "ATA".into(),
            model: "Disk".into(),
            revision: "1".into(),
            serial: "X".into(),
        },
    );
    let mut engine = SyncEngine::new(vec![Box::new(source.clone())]);

    let first = engine.resync().expect("first pass");
    assert_eq!(first.added.len(), 2);

    let second = engine.resync().expect("second pass");
    assert!(second.added.is_empty(), "got: {second:?}");
    assert!(second.removed.is_empty(), "got: {second:?}");
    assert!(second.is_noop());
    assert_eq!(engine.passes(), 2);
}

/// Small deterministic generator so the interleaving is reproducible.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn every_entity_has_at_most_one_wrapper_across_interleavings() {
    init_logging();
    let udisks = MemorySource::new("udisks");
    let lvm = MemorySource::new("lvm");
    let mut engine = SyncEngine::new(vec![Box::new(udisks.clone()), Box::new(lvm.clone())]);
    let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);

    for step in 0..500 {
        let n = rng.next() % 8;
        match rng.next() % 5 {
            0 | 1 => udisks.upsert(format!("/b/{n}"), block(&format!("/dev/sd{n}"))),
            2 => {
                udisks.remove(&format!("/b/{n}"));
            }
            // Same name from two ids forces path collisions.
            3 => lvm.upsert(format!("/vg/{n}"), EntityKind::VolumeGroup { name: "vg".into() }),
            _ => {
                lvm.remove(&format!("/vg/{n}"));
            }
        }
        if rng.next() % 3 == 0 {
            continue;
        }
        engine.resync().expect("resync");

        let mut per_key: BTreeMap<&EntityKey, usize> = BTreeMap::new();
        let mut per_path: BTreeMap<&ObjectPath, usize> = BTreeMap::new();
        for object in engine.objects() {
            *per_key.entry(&object.entity.key).or_default() += 1;
            *per_path.entry(&object.path).or_default() += 1;
        }
        assert!(per_key.values().all(|&c| c == 1), "step {step}: duplicate wrapper");
        assert!(per_path.values().all(|&c| c == 1), "step {step}: duplicate path");

        for object in engine.objects() {
            assert_eq!(engine.translate_path(&object.entity.key), object.path);
        }
    }

    // Final pass reflects exactly the upstream contents.
    engine.resync().expect("resync");
    let wanted = udisks.snapshot().expect("snapshot").len() + lvm.snapshot().expect("snapshot").len();
    assert_eq!(engine.len(), wanted);
}

#[test]
fn sysfs_hotplug_is_reflected_and_remembered_configs_restored() {
    init_logging();
    let sys = TempDir::new().expect("sysfs");
    let state = TempDir::new().expect("state");
    let sdb = sys.path().join("class/block/sdb");
    fs::create_dir_all(&sdb).expect("mkdir");
    fs::write(sdb.join("size"), "8\n").expect("size");

    let store = Arc::new(RememberedConfigs::new(state.path().join("remembered-configs.yaml")));
    let mut engine =
        SyncEngine::new(vec![Box::new(SysfsSource::new(sys.path()))]).with_config_store(store.clone());
    let first = engine.resync().expect("resync");
    let path = ObjectPath::from("/org/storaged/Storage/block_devices/sdb");
    assert_eq!(first.added, vec![path.clone()]);

    // Unplug; business logic remembers a child entry for the parent.
    fs::remove_dir_all(&sdb).expect("unplug");
    let gone = engine.resync().expect("resync");
    assert_eq!(gone.removed, vec![path.clone()]);
    store.remember(&path, "sdb1", serde_yaml::Value::from("UUID=42 /srv xfs"));

    // Replug: the wrapper gets the remembered entry back.
    fs::create_dir_all(&sdb).expect("mkdir");
    fs::write(sdb.join("size"), "8\n").expect("size");
    engine.resync().expect("resync");
    let object = engine.lookup(&path).expect("republished");
    assert_eq!(object.remembered, vec![serde_yaml::Value::from("UUID=42 /srv xfs")]);
    assert!(!store.is_dirty());
    assert_eq!(
        engine.translate_path(&EntityKey::new("sysfs", "block:sdb")),
        path
    );
}

#[test]
fn only_selected_upstream_jobs_are_mirrored() {
    init_logging();
    let source = MemorySource::new("udisks");
    let job = |op: &str| EntityKind::Job {
        operation: op.to_string(),
    };
    source.upsert("/udisks/jobs/1", job("format-mkfs"));
    source.upsert("/udisks/jobs/2", job("filesystem-mount"));
    source.upsert("/udisks/jobs/3", job("lvm-vg-empty-device"));
    let mut engine = SyncEngine::new(vec![Box::new(source.clone())]);

    let report = engine.resync().expect("pass");
    let mut added: Vec<_> = report.added.iter().map(|p| p.as_str().to_string()).collect();
    added.sort();
    assert_eq!(
        added,
        vec![
            "/org/storaged/Storage/jobs/format_2dmkfs".to_string(),
            "/org/storaged/Storage/jobs/lvm_2dvg_2dempty_2ddevice".to_string(),
        ]
    );

    assert!(source.remove("/udisks/jobs/1"));
    let report = engine.resync().expect("pass");
    assert_eq!(
        report.removed,
        vec![ObjectPath::from("/org/storaged/Storage/jobs/format_2dmkfs")]
    );
    assert!(report.added.is_empty());
}
