//! Daemon configuration file.
//!
//! ```yaml
//! persist: false
//! socket_path: /run/storaged/storaged.sock
//! state_dir: /var/lib/storaged
//! debounce_ms: 200
//! rescan_command: [udevadm, trigger, --action=change]
//! authority:
//!   kind: static
//!   rules:
//!     - action_id: org.storaged.manage-storage
//!       answer: auth_admin
//! ```
//!
//! Every field is optional. A missing file yields [`DaemonConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};

/// Where the daemon looks for its configuration when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/storaged/storaged.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Keep running when there are no clients and no jobs.
    pub persist: bool,
    pub socket_path: PathBuf,
    /// Directory holding the remembered-config store.
    pub state_dir: PathBuf,
    pub sysfs_root: PathBuf,
    /// Watched for device node creation/removal.
    pub dev_dir: PathBuf,
    /// Coalescing window for upstream change notifications.
    pub debounce_ms: u64,
    /// Upper bound on how long an authorization check waits for the caller's uid.
    pub resolve_timeout_ms: u64,
    /// Grace period before a non-persistent daemon exits once idle.
    pub idle_exit_ms: u64,
    /// Program and leading arguments of `Block.Rescan`; the device file is appended.
    pub rescan_command: Vec<String>,
    pub authority: AuthorityConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            persist: false,
            socket_path: PathBuf::from("/run/storaged/storaged.sock"),
            state_dir: PathBuf::from("/var/lib/storaged"),
            sysfs_root: PathBuf::from("/sys"),
            dev_dir: PathBuf::from("/dev"),
            debounce_ms: 200,
            resolve_timeout_ms: 25_000,
            idle_exit_ms: 30_000,
            rescan_command: vec![
                "udevadm".to_string(),
                "trigger".to_string(),
                "--action=change".to_string(),
            ],
            authority: AuthorityConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn idle_exit_delay(&self) -> Duration {
        Duration::from_millis(self.idle_exit_ms)
    }

    /// Path of the remembered-config store inside `state_dir`.
    pub fn remembered_configs_path(&self) -> PathBuf {
        self.state_dir.join("remembered-configs.yaml")
    }

    fn validate(self) -> Result<Self, CoreError> {
        if self.resolve_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "resolve_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.rescan_command.is_empty() {
            return Err(CoreError::InvalidConfig(
                "rescan_command must name a program".to_string(),
            ));
        }
        if let AuthorityConfig::Pkcheck { binary } = &self.authority {
            if binary.as_os_str().is_empty() {
                return Err(CoreError::InvalidConfig(
                    "authority.binary must not be empty".to_string(),
                ));
            }
        }
        Ok(self)
    }
}

/// Which policy authority gates privileged calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthorityConfig {
    /// Ask polkit through its `pkcheck` helper.
    Pkcheck {
        #[serde(default = "default_pkcheck")]
        binary: PathBuf,
    },
    /// Fixed answers per action id.
    Static {
        #[serde(default)]
        rules: Vec<StaticRule>,
        #[serde(default)]
        default_answer: PolicyAnswer,
    },
    /// No authority at all: only root is authorized.
    None,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        AuthorityConfig::Pkcheck {
            binary: default_pkcheck(),
        }
    }
}

fn default_pkcheck() -> PathBuf {
    PathBuf::from("/usr/bin/pkcheck")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRule {
    pub action_id: String,
    pub answer: PolicyAnswer,
}

/// Answer of a static rule, modelled on polkit's implicit authorizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAnswer {
    Yes,
    No,
    #[default]
    AuthAdmin,
}

/// Load configuration from `path`; a missing file yields the defaults.
pub fn load_at(path: &Path) -> Result<DaemonConfig, CoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(DaemonConfig::default())
        }
        Err(err) => return Err(io_err(path, err)),
    };
    if contents.trim().is_empty() {
        return Ok(DaemonConfig::default());
    }
    let config: DaemonConfig = serde_yaml::from_str(&contents).map_err(|source| {
        CoreError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    config.validate()
}

/// `load_at` for [`DEFAULT_CONFIG_PATH`].
pub fn load() -> Result<DaemonConfig, CoreError> {
    load_at(Path::new(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = load_at(&dir.path().join("absent.yaml")).expect("load");
        assert_eq!(config, DaemonConfig::default());
        assert!(!config.persist);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("storaged.yaml");
        std::fs::write(&path, "persist: true\ndebounce_ms: 50\n").expect("write");

        let config = load_at(&path).expect("load");
        assert!(config.persist);
        assert_eq!(config.debounce_window(), Duration::from_millis(50));
        assert_eq!(config.socket_path, DaemonConfig::default().socket_path);
    }

    #[test]
    fn static_authority_rules_parse() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("storaged.yaml");
        std::fs::write(
            &path,
            "authority:\n  kind: static\n  rules:\n    - action_id: org.storaged.cancel-job\n      answer: yes\n",
        )
        .expect("write");

        let config = load_at(&path).expect("load");
        match config.authority {
            AuthorityConfig::Static {
                rules,
                default_answer,
            } => {
                assert_eq!(rules.len(), 1);
                assert_eq!(rules[0].answer, PolicyAnswer::Yes);
                assert_eq!(default_answer, PolicyAnswer::AuthAdmin);
            }
            other => panic!("expected static authority, got {other:?}"),
        }
    }

    #[test]
    fn zero_resolve_timeout_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("storaged.yaml");
        std::fs::write(&path, "resolve_timeout_ms: 0\n").expect("write");

        let err = load_at(&path).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)), "got: {err}");
    }

    #[test]
    fn malformed_yaml_reports_path() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("storaged.yaml");
        std::fs::write(&path, "persist: [unclosed").expect("write");

        let err = load_at(&path).unwrap_err();
        assert!(err.to_string().contains("storaged.yaml"), "got: {err}");
    }
}
