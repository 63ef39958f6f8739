//! Cluster-relative path normalization
//!
//! Every path that reaches the permission cache or a storage backend goes
//! through [`NormalizedPath::parse`] first. Normalized paths are absolute,
//! case-sensitive, slash-separated and carry no trailing slash (except the
//! root itself, which is `/`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Path validation failure, raised before any cache or authority interaction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path contains a NUL byte")]
    NulByte,

    #[error("path component '{0}' is not allowed")]
    RelativeComponent(String),
}

/// A validated, normalized cluster-relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NormalizedPath(String);

impl NormalizedPath {
    /// The root prefix. Always the last candidate in a hierarchy walk.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and normalize a raw operation path
    ///
    /// Accepts paths with or without a leading slash, collapses repeated
    /// slashes and drops a trailing slash. Rejects empty input, NUL bytes
    /// and `.` / `..` components.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if raw.contains('\0') {
            return Err(PathError::NulByte);
        }

        let mut normalized = String::with_capacity(raw.len() + 1);
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(PathError::RelativeComponent(segment.to_string()));
            }
            normalized.push('/');
            normalized.push_str(segment);
        }

        if normalized.is_empty() {
            // Only slashes, e.g. "/" or "///"
            return Ok(Self::root());
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, root has none
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Number of segments below the root
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Final segment, `None` for the root
    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// The path itself followed by every parent, ending with `/`
    pub fn ancestors(&self) -> Ancestors {
        Ancestors {
            next: Some(self.clone()),
        }
    }

    /// True if `self` equals `prefix` or lies below it
    pub fn starts_with(&self, prefix: &NormalizedPath) -> bool {
        if prefix.is_root() || self.0 == prefix.0 {
            return true;
        }
        self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/')
    }

    /// Remainder of `self` below `prefix`, as a path rooted at `/`
    pub fn strip_prefix(&self, prefix: &NormalizedPath) -> Option<Self> {
        if !self.starts_with(prefix) {
            return None;
        }
        if prefix.is_root() {
            return Some(self.clone());
        }
        let rest = &self.0[prefix.0.len()..];
        if rest.is_empty() {
            Some(Self::root())
        } else {
            Some(Self(rest.to_string()))
        }
    }

    /// Append a single relative segment or sub-path
    pub fn join(&self, child: &str) -> Result<Self, PathError> {
        let child = Self::parse(child)?;
        if child.is_root() {
            return Ok(self.clone());
        }
        if self.is_root() {
            return Ok(child);
        }
        Ok(Self(format!("{}{}", self.0, child.0)))
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NormalizedPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NormalizedPath> for String {
    fn from(path: NormalizedPath) -> Self {
        path.0
    }
}

impl std::str::FromStr for NormalizedPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Iterator over a path and its parents, deepest first
#[derive(Debug, Clone)]
pub struct Ancestors {
    next: Option<NormalizedPath>,
}

impl Iterator for Ancestors {
    type Item = NormalizedPath;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.parent();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> NormalizedPath {
        NormalizedPath::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_normalizes_slashes() {
        assert_eq!(p("/org/proj").as_str(), "/org/proj");
        assert_eq!(p("org/proj").as_str(), "/org/proj");
        assert_eq!(p("//org///proj/").as_str(), "/org/proj");
        assert_eq!(p("/").as_str(), "/");
        assert_eq!(p("///").as_str(), "/");
    }

    #[test]
    fn test_parse_is_case_sensitive() {
        assert_ne!(p("/Org"), p("/org"));
    }

    #[test]
    fn test_parse_rejects_invalid_input() {
        assert_eq!(NormalizedPath::parse(""), Err(PathError::Empty));
        assert_eq!(NormalizedPath::parse("/a\0b"), Err(PathError::NulByte));
        assert_eq!(
            NormalizedPath::parse("/a/../b"),
            Err(PathError::RelativeComponent("..".to_string()))
        );
        assert_eq!(
            NormalizedPath::parse("./a"),
            Err(PathError::RelativeComponent(".".to_string()))
        );
    }

    #[test]
    fn test_ancestors_walk_deepest_first_and_end_at_root() {
        let walk: Vec<String> = p("/a/b/c/file").ancestors().map(String::from).collect();
        assert_eq!(walk, vec!["/a/b/c/file", "/a/b/c", "/a/b", "/a", "/"]);

        let root: Vec<String> = NormalizedPath::root().ancestors().map(String::from).collect();
        assert_eq!(root, vec!["/"]);
    }

    #[test]
    fn test_starts_with_respects_segment_boundaries() {
        assert!(p("/a/b/c").starts_with(&p("/a/b")));
        assert!(p("/a/b").starts_with(&p("/a/b")));
        assert!(p("/a/b").starts_with(&NormalizedPath::root()));
        assert!(!p("/a/bc").starts_with(&p("/a/b")));
        assert!(!p("/a").starts_with(&p("/a/b")));
    }

    #[test]
    fn test_strip_prefix_and_join() {
        assert_eq!(p("/vol/data/x").strip_prefix(&p("/vol")), Some(p("/data/x")));
        assert_eq!(p("/vol").strip_prefix(&p("/vol")), Some(NormalizedPath::root()));
        assert_eq!(p("/other").strip_prefix(&p("/vol")), None);

        assert_eq!(p("/a").join("b/c").unwrap(), p("/a/b/c"));
        assert_eq!(NormalizedPath::root().join("b").unwrap(), p("/b"));
        assert!(p("/a").join("..").is_err());
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(p("/a/b").parent(), Some(p("/a")));
        assert_eq!(p("/a").parent(), Some(NormalizedPath::root()));
        assert_eq!(NormalizedPath::root().parent(), None);
        assert_eq!(p("/a/b").file_name(), Some("b"));
        assert_eq!(NormalizedPath::root().file_name(), None);
        assert_eq!(p("/a/b").depth(), 2);
    }

    #[test]
    fn test_serde_round_trips_through_validation() {
        let path: NormalizedPath = serde_json::from_str("\"a//b/\"").unwrap();
        assert_eq!(path.as_str(), "/a/b");
        assert!(serde_json::from_str::<NormalizedPath>("\"/a/..\"").is_err());
    }
}
