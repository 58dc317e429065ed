//! Remembered configuration entries.
//!
//! When a device disappears, configuration that belonged to its children
//! (fstab/crypttab style entries) is remembered under the parent's object
//! path. When an object with that path is published again, the entries are
//! handed back and forgotten.
//!
//! # Storage layout
//!
//! ```text
//! <state_dir>/
//!   remembered-configs.yaml      (mode 0600)
//! ```
//!
//! Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::types::ObjectPath;

/// child path → remembered value
pub type ChildConfigs = BTreeMap<String, serde_yaml::Value>;

/// What the synchronization engine needs from a config store.
pub trait ConfigStore: Send + Sync {
    /// Fetch and forget every entry remembered under `parent`.
    fn take_remembered(&self, parent: &ObjectPath) -> Vec<serde_yaml::Value>;

    /// Persist pending changes. Returns whether anything was written.
    fn save_if_dirty(&self) -> Result<bool, CoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    configs: BTreeMap<String, ChildConfigs>,
}

#[derive(Debug, Default)]
struct Inner {
    configs: BTreeMap<String, ChildConfigs>,
    dirty: bool,
}

/// File-backed [`ConfigStore`].
#[derive(Debug)]
pub struct RememberedConfigs {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl RememberedConfigs {
    /// Empty store that will save to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Load the store at `path`; a missing file yields an empty store.
    pub fn load_at(path: &Path) -> Result<Self, CoreError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(path))
            }
            Err(err) => return Err(io_err(path, err)),
        };
        let file: StoreFile = serde_yaml::from_str(&contents).map_err(|source| {
            CoreError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                configs: file.configs,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remember `config` for `child` under `parent`. Re-remembering an equal
    /// value does not mark the store dirty.
    pub fn remember(&self, parent: &ObjectPath, child: &str, config: serde_yaml::Value) {
        let mut inner = self.lock();
        let children = inner.configs.entry(parent.0.clone()).or_default();
        if children.get(child) == Some(&config) {
            return;
        }
        children.insert(child.to_owned(), config);
        inner.dirty = true;
    }

    /// Snapshot of everything remembered under `parent`, without forgetting.
    pub fn peek(&self, parent: &ObjectPath) -> ChildConfigs {
        self.lock()
            .configs
            .get(&parent.0)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for RememberedConfigs {
    fn take_remembered(&self, parent: &ObjectPath) -> Vec<serde_yaml::Value> {
        let mut inner = self.lock();
        match inner.configs.remove(&parent.0) {
            Some(children) => {
                inner.dirty = true;
                children.into_values().collect()
            }
            None => Vec::new(),
        }
    }

    fn save_if_dirty(&self) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        if !inner.dirty {
            return Ok(false);
        }

        let file = StoreFile {
            saved_at: Some(Utc::now()),
            configs: inner.configs.clone(),
        };
        let yaml = serde_yaml::to_string(&file)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            }
        }
        let tmp_path = tmp_sibling(&self.path);
        std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
        set_file_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| io_err(&self.path, e))?;

        inner.dirty = false;
        Ok(true)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "remembered-configs.yaml".to_string());
    path.with_file_name(format!("{name}.tmp"))
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parent() -> ObjectPath {
        ObjectPath::from("/org/storaged/Storage/block_devices/sda")
    }

    #[test]
    fn take_forgets_and_marks_dirty() {
        let store = RememberedConfigs::new("/nonexistent/store.yaml");
        store.remember(&parent(), "sda1", serde_yaml::Value::from("fstab:/home"));
        store.remember(&parent(), "sda2", serde_yaml::Value::from("crypttab:luks"));

        let taken = store.take_remembered(&parent());
        assert_eq!(taken.len(), 2);
        assert!(store.take_remembered(&parent()).is_empty());
        assert!(store.is_dirty());
    }

    #[test]
    fn take_of_unknown_parent_does_not_dirty() {
        let store = RememberedConfigs::new("/nonexistent/store.yaml");
        assert!(store.take_remembered(&parent()).is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn remembering_equal_value_twice_stays_clean_after_save() {
        let home = TempDir::new().expect("tempdir");
        let store = RememberedConfigs::new(home.path().join("store.yaml"));
        store.remember(&parent(), "sda1", serde_yaml::Value::from("x"));
        assert!(store.save_if_dirty().expect("save"));

        store.remember(&parent(), "sda1", serde_yaml::Value::from("x"));
        assert!(!store.is_dirty());
        assert!(!store.save_if_dirty().expect("second save"));
    }

    #[test]
    fn save_is_atomic_and_private() {
        let home = TempDir::new().expect("tempdir");
        let path = home.path().join("state").join("store.yaml");
        let store = RememberedConfigs::new(&path);
        store.remember(&parent(), "sda1", serde_yaml::Value::from("x"));
        store.save_if_dirty().expect("save");

        assert!(path.exists());
        assert!(!tmp_sibling(&path).exists(), ".tmp must be gone after save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
