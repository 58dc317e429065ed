//! Domain types shared by every storaged crate.
//!
//! Object paths and peer names are plain strings on the wire; the newtypes
//! here keep them from being mixed up with each other or with device files.

use std::fmt;

use serde::{Deserialize, Serialize};

/// OS user id of a bus peer.
pub type Uid = u32;

/// The superuser. Always authorized when no policy authority is reachable.
pub const ROOT_UID: Uid = 0;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Path of an object published by the daemon, e.g. `/org/storaged/jobs/3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectPath(pub String);

impl ObjectPath {
    /// The "no object" sentinel returned by lookups that found nothing.
    pub fn none() -> Self {
        Self("/".to_owned())
    }

    pub fn is_none(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one escaped segment: `/a` + `sd a` → `/a/sd_20a`.
    pub fn child(&self, segment: &str) -> Self {
        let base = self.0.trim_end_matches('/');
        Self(format!("{base}/{}", escape_segment(segment)))
    }

    /// Whether this path lives directly or indirectly below `prefix`.
    pub fn is_below(&self, prefix: &ObjectPath) -> bool {
        let prefix = prefix.0.trim_end_matches('/');
        self.0.len() > prefix.len()
            && self.0.starts_with(prefix)
            && self.0.as_bytes()[prefix.len()] == b'/'
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ObjectPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ObjectPath {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Unique name of a connected bus peer, e.g. `:1.42`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Monotonic identity of a job; its object path is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Path escaping
// ---------------------------------------------------------------------------

/// Escape free text into a single object-path segment.
///
/// ASCII letters and digits pass through; every other byte (including `_`)
/// becomes `_xx` with two lowercase hex digits, so distinct inputs never
/// collide. The empty string escapes to `_`.
pub fn escape_segment(raw: &str) -> String {
    if raw.is_empty() {
        return "_".to_owned();
    }
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(ObjectPath::from("/org/x").to_string(), "/org/x");
        assert_eq!(PeerId::from(":1.7").to_string(), ":1.7");
        assert_eq!(JobId(3).to_string(), "3");
    }

    #[test]
    fn none_sentinel() {
        assert!(ObjectPath::none().is_none());
        assert!(!ObjectPath::from("/org").is_none());
    }

    #[test]
    fn escape_keeps_alphanumerics_and_hexes_the_rest() {
        assert_eq!(escape_segment("sda1"), "sda1");
        assert_eq!(escape_segment("mapper/luks-1"), "mapper_2fluks_2d1");
        assert_eq!(escape_segment("a_b"), "a_5fb");
        assert_eq!(escape_segment(""), "_");
    }

    #[test]
    fn child_joins_with_single_slash() {
        let base = ObjectPath::from("/org/storaged/Storage/");
        assert_eq!(base.child("vg0").as_str(), "/org/storaged/Storage/vg0");
    }

    #[test]
    fn is_below_requires_segment_boundary() {
        let jobs = ObjectPath::from("/org/storaged/jobs");
        assert!(ObjectPath::from("/org/storaged/jobs/1").is_below(&jobs));
        assert!(!ObjectPath::from("/org/storaged/jobsx").is_below(&jobs));
        assert!(!jobs.is_below(&jobs));
    }
}
