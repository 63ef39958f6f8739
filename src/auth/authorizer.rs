//! Hierarchical authorization over cached permissions
//!
//! A request for `path` walks from the path itself up to the root and stops
//! at the most specific prefix with a live cached entry. That entry holds the
//! authority's permission tree for its whole subtree, so `path` is resolved
//! through it and a grant or revocation deeper than the entry's prefix still
//! governs. The outcome does not depend on which prefixes were cached first.
//! Only when no prefix is cached is the authority asked, once, for the full
//! path.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, instrument};

use super::audit::{AuditEvent, AuditOutcome, AuditSink};
use super::cache::PermissionCache;
use super::path::{NormalizedPath, PathError};
use super::types::{AccessLevel, AuthorizationDecision, CacheState, Principal};
use crate::observability::metrics::record_authorization_check;
use crate::services::authority::AuthorityError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub decision: AuthorizationDecision,
    pub cache_state: CacheState,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthorizeError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("request has no authenticated principal")]
    Unauthenticated,

    #[error("authorization unavailable for {path}: {source}")]
    Unavailable {
        path: NormalizedPath,
        #[source]
        source: AuthorityError,
    },
}

#[derive(Clone)]
pub struct PathAuthorizer {
    cache: PermissionCache,
    audit: Arc<dyn AuditSink>,
}

impl PathAuthorizer {
    pub fn new(cache: PermissionCache, audit: Arc<dyn AuditSink>) -> Self {
        Self { cache, audit }
    }

    pub fn cache(&self) -> &PermissionCache {
        &self.cache
    }

    /// Validate `raw_path` and authorize it
    pub async fn authorize(
        &self,
        principal: &Principal,
        raw_path: &str,
        required: AccessLevel,
    ) -> Result<Authorization, AuthorizeError> {
        let path = NormalizedPath::parse(raw_path)?;
        self.authorize_path(principal, &path, required).await
    }

    #[instrument(skip_all, fields(principal = %principal, path = %path, level = %required))]
    pub async fn authorize_path(
        &self,
        principal: &Principal,
        path: &NormalizedPath,
        required: AccessLevel,
    ) -> Result<Authorization, AuthorizeError> {
        if principal.is_anonymous() {
            return Err(AuthorizeError::Unauthenticated);
        }

        let started = Instant::now();
        let result = self.resolve(principal, path, required).await;
        let elapsed = started.elapsed();

        let (outcome, matched_prefix, cache_state) = match &result {
            Ok(authorization) => {
                let outcome = if authorization.decision.is_allowed() {
                    AuditOutcome::Allowed
                } else {
                    AuditOutcome::Denied
                };
                (
                    outcome,
                    Some(authorization.decision.matched_prefix().clone()),
                    Some(authorization.cache_state),
                )
            }
            Err(_) => (AuditOutcome::Unavailable, None, None),
        };

        record_authorization_check(required, outcome, cache_state, elapsed);
        self.audit.record(AuditEvent {
            timestamp: Utc::now(),
            principal: principal.clone(),
            path: path.clone(),
            access_level: required,
            outcome,
            matched_prefix,
            cache_state,
            duration_ms: elapsed.as_millis() as u64,
        });

        result
    }

    async fn resolve(
        &self,
        principal: &Principal,
        path: &NormalizedPath,
        required: AccessLevel,
    ) -> Result<Authorization, AuthorizeError> {
        for prefix in path.ancestors() {
            if let Some(hit) = self.cache.peek(principal, &prefix, path) {
                debug!(
                    prefix = %prefix,
                    matched = %hit.matched_prefix,
                    state = %hit.state,
                    "Cached permission tree governs"
                );
                return Ok(Authorization {
                    decision: hit.decide(required),
                    cache_state: hit.state,
                });
            }
        }

        let fetched = self
            .cache
            .lookup(principal, path, required)
            .await
            .map_err(|source| AuthorizeError::Unavailable {
                path: path.clone(),
                source,
            })?;

        Ok(Authorization {
            decision: fetched.decide(required),
            cache_state: fetched.state,
        })
    }
}
