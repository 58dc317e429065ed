//! storaged core library — domain newtypes, configuration, remembered-config store.
//!
//! - [`types`] — `ObjectPath`, `PeerId`, `JobId`, path escaping
//! - [`config`] — [`DaemonConfig`] loading
//! - [`remembered`] — [`RememberedConfigs`] and the [`ConfigStore`] seam
//! - [`error`] — [`CoreError`]

pub mod config;
pub mod error;
pub mod remembered;
pub mod types;

pub use config::{AuthorityConfig, DaemonConfig, PolicyAnswer, StaticRule};
pub use error::CoreError;
pub use remembered::{ConfigStore, RememberedConfigs};
pub use types::{escape_segment, JobId, ObjectPath, PeerId, Uid, ROOT_UID};
