//! # Collection Path Canonicalization and Decomposition
//!
//! A collection path is an absolute, slash-separated identifier rooted at
//! `/db`. This module owns the one true canonical string form (so that two
//! callers spelling "the same" path always hash to the same stripe latch)
//! and the ancestor-chain decomposition that lock coupling walks.

use crate::error::{LockError, LockResult};
use std::fmt;
use std::sync::Arc;

/// Canonical, slash-separated collection path, always rooted at `/db`.
///
/// Wraps an `Arc<str>` rather than a `String`: the same path is cloned into
/// every `LockAction` event fanned out to listeners, and `Arc<str>` clones
/// are a refcount bump instead of a heap allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CollectionPath(Arc<str>);

impl CollectionPath {
    /// Root of every collection tree.
    pub const ROOT: &'static str = "/db";

    /// Parse and canonicalize a raw path string.
    ///
    /// # Errors
    ///
    /// Returns `LockError::InvalidPath` if `raw` does not start with `/db`,
    /// contains an empty segment (including a doubled `/`), or is empty.
    pub fn parse(raw: &str) -> LockResult<Self> {
        if raw.is_empty() {
            return Err(LockError::InvalidPath {
                path: raw.to_string(),
                reason: "path is empty",
            });
        }
        if !raw.starts_with(Self::ROOT) {
            return Err(LockError::InvalidPath {
                path: raw.to_string(),
                reason: "path does not start with /db",
            });
        }

        // Trailing slash is normalized away; anything else after the root
        // must begin with '/'.
        let rest = raw.strip_prefix(Self::ROOT).unwrap_or("");
        let trimmed = rest.strip_suffix('/').unwrap_or(rest);
        if !trimmed.is_empty() && !trimmed.starts_with('/') {
            return Err(LockError::InvalidPath {
                path: raw.to_string(),
                reason: "segment following /db must start with /",
            });
        }
        if trimmed.split('/').skip(1).any(str::is_empty) {
            return Err(LockError::InvalidPath {
                path: raw.to_string(),
                reason: "path contains an empty segment",
            });
        }

        let canonical = format!("{}{}", Self::ROOT, trimmed);
        Ok(CollectionPath(Arc::from(canonical.as_str())))
    }

    /// Borrow the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if this path is the root `/db`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.as_ref() == Self::ROOT
    }

    /// The direct parent of this path, or `None` if this path is the root.
    #[must_use]
    pub fn parent(&self) -> Option<CollectionPath> {
        if self.is_root() {
            return None;
        }
        let s = self.0.as_ref();
        let idx = s.rfind('/').unwrap_or(0);
        let parent = if idx == 0 { Self::ROOT } else { &s[..idx] };
        Some(CollectionPath(Arc::from(parent)))
    }

    /// Root-to-leaf ancestor chain: `[/db, ..., self]`.
    ///
    /// `ancestors("/db") == ["/db"]`. Every element is a proper prefix of
    /// the next, split at a segment boundary.
    #[must_use]
    pub fn ancestors(&self) -> Vec<CollectionPath> {
        let mut chain = Vec::new();
        let mut current = Some(self.clone());
        while let Some(p) = current {
            let parent = p.parent();
            chain.push(p);
            current = parent;
        }
        chain.reverse();
        chain
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn root_parses() {
        let p = CollectionPath::parse("/db").unwrap();
        assert!(p.is_root());
        assert_eq!(p.as_str(), "/db");
    }

    #[test]
    fn trailing_slash_normalized() {
        let p = CollectionPath::parse("/db/colA/").unwrap();
        assert_eq!(p.as_str(), "/db/colA");
    }

    #[test]
    fn rejects_non_db_root() {
        assert!(CollectionPath::parse("/etc/colA").is_err());
        assert!(CollectionPath::parse("relative").is_err());
    }

    #[test]
    fn rejects_doubled_slash() {
        assert!(CollectionPath::parse("/db//colA").is_err());
        assert!(CollectionPath::parse("/db/colA//colB").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(CollectionPath::parse("").is_err());
    }

    #[test]
    fn ancestors_of_root_is_singleton() {
        let p = CollectionPath::parse("/db").unwrap();
        assert_eq!(p.ancestors(), vec![p]);
    }

    #[test]
    fn ancestors_root_to_leaf() {
        let p = CollectionPath::parse("/db/colA/colB").unwrap();
        let chain = p.ancestors();
        let as_strs: Vec<&str> = chain.iter().map(CollectionPath::as_str).collect();
        assert_eq!(as_strs, vec!["/db", "/db/colA", "/db/colA/colB"]);
    }

    #[test]
    fn parent_of_depth_two_is_root() {
        let p = CollectionPath::parse("/db/colA").unwrap();
        assert_eq!(p.parent(), Some(CollectionPath::parse("/db").unwrap()));
    }

    #[test]
    fn parent_of_root_is_none() {
        let p = CollectionPath::parse("/db").unwrap();
        assert_eq!(p.parent(), None);
    }

    proptest::proptest! {
        #[test]
        fn distinct_canonical_paths_have_distinct_ancestor_chains(
            a in "[a-zA-Z0-9]{1,8}",
            b in "[a-zA-Z0-9]{1,8}",
        ) {
            if a != b {
                let pa = CollectionPath::parse(&format!("/db/{a}")).unwrap();
                let pb = CollectionPath::parse(&format!("/db/{b}")).unwrap();
                proptest::prop_assert_ne!(pa.ancestors(), pb.ancestors());
            }
        }

        #[test]
        fn ancestors_always_end_in_self(segs in proptest::collection::vec("[a-zA-Z0-9]{1,6}", 0..5)) {
            let raw = if segs.is_empty() {
                "/db".to_string()
            } else {
                format!("/db/{}", segs.join("/"))
            };
            let p = CollectionPath::parse(&raw).unwrap();
            let chain = p.ancestors();
            proptest::prop_assert_eq!(chain.last().cloned(), Some(p.clone()));
            proptest::prop_assert_eq!(chain.first().cloned(), Some(CollectionPath::parse("/db").unwrap()));
            proptest::prop_assert_eq!(chain.len(), segs.len() + 1);
        }
    }
}
