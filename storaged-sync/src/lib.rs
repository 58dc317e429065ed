//! # storaged-sync
//!
//! Reconciles the daemon's published objects with upstream storage state.
//!
//! Build a [`SyncEngine`] from one or more [`UpstreamSource`]s and call
//! [`SyncEngine::resync`] whenever upstream state may have changed. The
//! engine diffs the wanted set against what is published with
//! [`diff_sorted`] and applies only the delta.

pub mod differ;
pub mod engine;
pub mod error;
pub mod object_path;
pub mod sysfs;
pub mod upstream;

pub use differ::{diff_sorted, diff_sorted_keys, SortedDiff};
pub use engine::{PublishedObject, SyncEngine, SyncReport};
pub use error::SyncError;
pub use sysfs::SysfsSource;
pub use upstream::{EntityKey, EntityKind, MemorySource, UpstreamEntity, UpstreamSource};
