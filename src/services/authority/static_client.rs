//! In-process permission authority
//!
//! Evaluates a fixed grant table the same way the platform authority does:
//! the grant on the deepest prefix of the requested path governs, and an
//! explicit revocation entry at a deeper prefix overrides a broader grant.
//! Answers are permission trees listing every grant or revocation below the
//! requested prefix.
//! Used by `authority_mode = "static"` deployments and throughout the tests,
//! where it also records calls and can simulate latency and outages.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::{AuthorityError, AuthorityStats, PermissionAuthorityClient};
use crate::auth::path::NormalizedPath;
use crate::auth::types::{AccessLevel, AuthorityVerdict, PermissionTree, Principal};

/// One recorded `check` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityCall {
    pub principal: Principal,
    pub prefix: NormalizedPath,
    pub level: AccessLevel,
}

/// `None` marks an explicit revocation at that prefix
type GrantTable = HashMap<(Principal, NormalizedPath), Option<AccessLevel>>;

#[derive(Default)]
pub struct StaticAuthorityClient {
    grants: RwLock<GrantTable>,
    failure: RwLock<Option<AuthorityError>>,
    delay_ms: AtomicU64,
    calls: RwLock<Vec<AuthorityCall>>,
    call_count: AtomicU64,
    stats: RwLock<AuthorityStats>,
}

impl StaticAuthorityClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an iterator of (principal, path, level) grants
    pub fn with_grants<I>(grants: I) -> Self
    where
        I: IntoIterator<Item = (Principal, NormalizedPath, AccessLevel)>,
    {
        let table = grants
            .into_iter()
            .map(|(principal, path, level)| ((principal, path), Some(level)))
            .collect();
        Self {
            grants: RwLock::new(table),
            ..Self::default()
        }
    }

    pub async fn grant(&self, principal: &Principal, path: &NormalizedPath, level: AccessLevel) {
        self.grants
            .write()
            .await
            .insert((principal.clone(), path.clone()), Some(level));
    }

    /// Explicitly deny `path` and everything under it, overriding broader grants
    pub async fn revoke(&self, principal: &Principal, path: &NormalizedPath) {
        self.grants.write().await.insert((principal.clone(), path.clone()), None);
    }

    /// Make every subsequent call fail with `error` until cleared
    pub async fn fail_with(&self, error: AuthorityError) {
        *self.failure.write().await = Some(error);
    }

    pub async fn recover(&self) {
        *self.failure.write().await = None;
    }

    /// Artificial latency applied to every call
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub async fn calls(&self) -> Vec<AuthorityCall> {
        self.calls.read().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
        self.call_count.store(0, Ordering::SeqCst);
    }

    /// Effective level for `principal` at `path`, `None` when denied
    pub async fn effective_level(&self, principal: &Principal, path: &NormalizedPath) -> Option<AccessLevel> {
        effective_level(&*self.grants.read().await, principal, path)
    }

    /// Permission tree for `principal` rooted at `prefix`
    pub async fn tree(&self, principal: &Principal, prefix: &NormalizedPath) -> PermissionTree {
        let grants = self.grants.read().await;
        let verdict_at = |path: &NormalizedPath| match effective_level(&grants, principal, path) {
            Some(level) => AuthorityVerdict::Allow(level),
            None => AuthorityVerdict::Deny,
        };

        let mut root = PermissionTree::new(verdict_at(prefix));
        let below = grants
            .keys()
            .filter(|(owner, path)| owner == principal && path != prefix && path.starts_with(prefix));

        for (_, path) in below {
            let Some(relative) = path.strip_prefix(prefix) else {
                continue;
            };
            let mut node = &mut root;
            let mut current = prefix.clone();
            for segment in relative.segments() {
                let Ok(next) = current.join(segment) else {
                    break;
                };
                current = next;
                node = node
                    .children
                    .entry(segment.to_string())
                    .or_insert_with(|| PermissionTree::new(verdict_at(&current)));
            }
        }
        root
    }
}

fn effective_level(grants: &GrantTable, principal: &Principal, path: &NormalizedPath) -> Option<AccessLevel> {
    path.ancestors()
        .find_map(|prefix| grants.get(&(principal.clone(), prefix)).copied())
        .flatten()
}

#[async_trait]
impl PermissionAuthorityClient for StaticAuthorityClient {
    async fn check(
        &self,
        principal: &Principal,
        prefix: &NormalizedPath,
        level: AccessLevel,
        timeout: Duration,
    ) -> Result<PermissionTree, AuthorityError> {
        let start = Instant::now();
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.write().await.push(AuthorityCall {
            principal: principal.clone(),
            prefix: prefix.clone(),
            level,
        });

        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        let result = if delay > timeout {
            tokio::time::sleep(timeout).await;
            Err(AuthorityError::Timeout)
        } else {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.failure.read().await.clone() {
                Some(error) => Err(error),
                None => Ok(self.tree(principal, prefix).await),
            }
        };

        debug!(
            principal = %principal,
            prefix = %prefix,
            level = %level,
            verdict = ?result.as_ref().map(|tree| tree.verdict),
            "Static authority check"
        );

        self.stats.write().await.record(&result, start.elapsed());
        result
    }

    async fn health_check(&self) -> Result<bool, AuthorityError> {
        match self.failure.read().await.clone() {
            Some(error) => Err(error),
            None => Ok(true),
        }
    }

    async fn stats(&self) -> AuthorityStats {
        self.stats.read().await.clone()
    }
}
