//! Core authorization types shared by the cache, the authorizer and the gateway

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::path::NormalizedPath;

/// Ordered access level. Higher levels imply every lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Manage,
}

impl AccessLevel {
    /// All levels, weakest first
    pub const ALL: [AccessLevel; 3] = [AccessLevel::Read, AccessLevel::Write, AccessLevel::Manage];

    /// Whether a grant at `self` covers a request for `required`
    pub fn satisfies(self, required: AccessLevel) -> bool {
        self >= required
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Manage => "manage",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(AccessLevel::Read),
            "write" => Ok(AccessLevel::Write),
            "manage" => Ok(AccessLevel::Manage),
            other => Err(format!("unknown access level '{}'", other)),
        }
    }
}

/// Authenticated identity making a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty name carries no identity and is never sent to the authority
    pub fn is_anonymous(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Cache key: one authority answer per (principal, prefix, level)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionKey {
    pub principal: Principal,
    pub prefix: NormalizedPath,
    pub level: AccessLevel,
}

impl PermissionKey {
    pub fn new(principal: &Principal, prefix: &NormalizedPath, level: AccessLevel) -> Self {
        Self {
            principal: principal.clone(),
            prefix: prefix.clone(),
            level,
        }
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.principal, self.prefix, self.level)
    }
}

/// Definitive answer from the permission authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "granted_level", rename_all = "lowercase")]
pub enum AuthorityVerdict {
    Allow(AccessLevel),
    Deny,
}

impl AuthorityVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, AuthorityVerdict::Allow(_))
    }

    /// Turn the verdict into a decision for a request at `required`
    pub fn decide(&self, prefix: &NormalizedPath, required: AccessLevel) -> AuthorizationDecision {
        match *self {
            AuthorityVerdict::Allow(granted) if granted.satisfies(required) => AuthorizationDecision::Allowed {
                granted_level: granted,
                matched_prefix: prefix.clone(),
            },
            AuthorityVerdict::Allow(granted) => AuthorizationDecision::Denied(DenyReason::InsufficientLevel {
                prefix: prefix.clone(),
                granted,
                required,
            }),
            AuthorityVerdict::Deny => AuthorizationDecision::Denied(DenyReason::NoGrant {
                prefix: prefix.clone(),
            }),
        }
    }
}

/// The authority's answer for a prefix and everything below it
///
/// `children` holds the descendants whose verdict differs from their
/// parent's, plus the nodes leading to them. A path with no node of its own
/// inherits the verdict of its deepest ancestor node, so one tree answers
/// every path under its root exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionTree {
    pub verdict: AuthorityVerdict,
    pub children: BTreeMap<String, PermissionTree>,
}

impl PermissionTree {
    pub fn new(verdict: AuthorityVerdict) -> Self {
        Self {
            verdict,
            children: BTreeMap::new(),
        }
    }

    pub fn with_child(mut self, name: impl Into<String>, child: PermissionTree) -> Self {
        self.children.insert(name.into(), child);
        self
    }

    /// Verdict for `path` in this tree rooted at `root`, together with the
    /// path of the node that settled it. `None` if `path` is outside `root`.
    pub fn resolve(&self, root: &NormalizedPath, path: &NormalizedPath) -> Option<(AuthorityVerdict, NormalizedPath)> {
        let relative = path.strip_prefix(root)?;
        let mut node = self;
        let mut matched = root.clone();

        for segment in relative.segments() {
            let Some(child) = node.children.get(segment) else {
                break;
            };
            matched = matched.join(segment).ok()?;
            node = child;
        }
        Some((node.verdict, matched))
    }
}

/// Why a request was denied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// The authority holds no grant for the principal at this prefix
    NoGrant { prefix: NormalizedPath },
    /// A grant exists but is weaker than the request
    InsufficientLevel {
        prefix: NormalizedPath,
        granted: AccessLevel,
        required: AccessLevel,
    },
}

impl DenyReason {
    pub fn prefix(&self) -> &NormalizedPath {
        match self {
            DenyReason::NoGrant { prefix } => prefix,
            DenyReason::InsufficientLevel { prefix, .. } => prefix,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoGrant { prefix } => write!(f, "no grant at {}", prefix),
            DenyReason::InsufficientLevel {
                prefix,
                granted,
                required,
            } => write!(f, "{} granted at {}, {} required", granted, prefix, required),
        }
    }
}

/// Combined result of a hierarchy walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuthorizationDecision {
    Allowed {
        granted_level: AccessLevel,
        matched_prefix: NormalizedPath,
    },
    Denied(DenyReason),
}

impl AuthorizationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthorizationDecision::Allowed { .. })
    }

    /// The prefix whose entry decided the outcome
    pub fn matched_prefix(&self) -> &NormalizedPath {
        match self {
            AuthorizationDecision::Allowed { matched_prefix, .. } => matched_prefix,
            AuthorizationDecision::Denied(reason) => reason.prefix(),
        }
    }
}

/// How a decision was obtained, reported to audit and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Fresh,
    Stale,
    Miss,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Fresh => "fresh",
            CacheState::Stale => "stale",
            CacheState::Miss => "miss",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
