//! Storage gateway façade
//!
//! Every storage operation runs through the same sequence:
//!
//! ```text
//! Received -> Authorizing -> Authorized -> Executing -> Completed
//!                        \-> Denied --------------------> Completed
//!                        \-> AuthorizationFailed -------> Completed
//! ```
//!
//! Authorization is fully decided before the backend is touched, so a
//! request that is denied, or whose permissions cannot be determined, has no
//! side effects. An operation that started under an Allow runs to completion
//! even if the permission is revoked while it runs; the revocation applies to
//! the next request.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::auth::authorizer::{AuthorizeError, PathAuthorizer};
use crate::auth::path::{NormalizedPath, PathError};
use crate::auth::types::{AccessLevel, AuthorizationDecision, CacheState, DenyReason, Principal};
use crate::observability::metrics::record_storage_operation;
use crate::services::authority::AuthorityError;
use crate::services::storage::{BackendError, BackendRouter, DiskUsage, FileStatus, Routed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Received,
    Authorizing,
    Authorized,
    Executing,
    Completed,
    Denied,
    AuthorizationFailed,
}

impl OperationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPhase::Received => "received",
            OperationPhase::Authorizing => "authorizing",
            OperationPhase::Authorized => "authorized",
            OperationPhase::Executing => "executing",
            OperationPhase::Completed => "completed",
            OperationPhase::Denied => "denied",
            OperationPhase::AuthorizationFailed => "authorization_failed",
        }
    }
}

/// The request was allowed from a cached answer past its soft expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleServed {
    pub matched_prefix: NormalizedPath,
}

/// Result of an allowed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorized<T> {
    pub value: T,
    pub granted_level: AccessLevel,
    pub matched_prefix: NormalizedPath,
    pub warning: Option<StaleServed>,
}

impl<T> Authorized<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Authorized<U> {
        Authorized {
            value: f(self.value),
            granted_level: self.granted_level,
            matched_prefix: self.matched_prefix,
            warning: self.warning,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("authentication required")]
    Unauthenticated,

    #[error("access to {path} denied: {reason}")]
    Denied { path: NormalizedPath, reason: DenyReason },

    #[error("authorization unavailable for {path}: {source}")]
    Unavailable {
        path: NormalizedPath,
        #[source]
        source: AuthorityError,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl GatewayError {
    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidPath(_) => "invalid_path",
            GatewayError::Unauthenticated => "unauthenticated",
            GatewayError::Denied { .. } => "denied",
            GatewayError::Unavailable { .. } => "unavailable",
            GatewayError::Backend(_) => "backend_error",
        }
    }
}

impl From<AuthorizeError> for GatewayError {
    fn from(error: AuthorizeError) -> Self {
        match error {
            AuthorizeError::InvalidPath(e) => GatewayError::InvalidPath(e),
            AuthorizeError::Unauthenticated => GatewayError::Unauthenticated,
            AuthorizeError::Unavailable { path, source } => GatewayError::Unavailable { path, source },
        }
    }
}

/// What an allowed authorization yields
struct Grant {
    granted_level: AccessLevel,
    matched_prefix: NormalizedPath,
    warning: Option<StaleServed>,
}

#[derive(Clone)]
pub struct StorageGateway {
    authorizer: PathAuthorizer,
    router: Arc<BackendRouter>,
}

impl StorageGateway {
    pub fn new(authorizer: PathAuthorizer, router: BackendRouter) -> Self {
        Self {
            authorizer,
            router: Arc::new(router),
        }
    }

    pub fn authorizer(&self) -> &PathAuthorizer {
        &self.authorizer
    }

    pub fn router(&self) -> &BackendRouter {
        &self.router
    }

    /// Authorize `required` on `path` for `principal`, then run `operation`
    /// against the backend mounted there
    pub async fn execute<T, F, Fut>(
        &self,
        principal: &Principal,
        path: &str,
        required: AccessLevel,
        operation: F,
    ) -> Result<Authorized<T>, GatewayError>
    where
        F: FnOnce(Routed) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.run("execute", principal, path, required, operation).await
    }

    pub async fn read(
        &self,
        principal: &Principal,
        path: &str,
        offset: u64,
        size: Option<u64>,
    ) -> Result<Authorized<Vec<u8>>, GatewayError> {
        self.run("read", principal, path, AccessLevel::Read, |routed| async move {
            routed.backend.read(&routed.relative, offset, size).await
        })
        .await
    }

    pub async fn write(
        &self,
        principal: &Principal,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<Authorized<()>, GatewayError> {
        self.run("write", principal, path, AccessLevel::Write, |routed| async move {
            routed.backend.write(&routed.relative, offset, data).await
        })
        .await
    }

    pub async fn create(&self, principal: &Principal, path: &str, data: &[u8]) -> Result<Authorized<()>, GatewayError> {
        self.run("create", principal, path, AccessLevel::Write, |routed| async move {
            routed.backend.create(&routed.relative, data).await
        })
        .await
    }

    pub async fn list(&self, principal: &Principal, path: &str) -> Result<Authorized<Vec<FileStatus>>, GatewayError> {
        self.run("list", principal, path, AccessLevel::Read, |routed| async move {
            let entries = routed.backend.list(&routed.relative).await?;
            Ok::<_, BackendError>(entries
                .into_iter()
                .map(|mut entry| {
                    entry.path = routed.to_cluster(&entry.path);
                    entry
                })
                .collect())
        })
        .await
    }

    /// Status of `path`, with the caller's granted level filled in
    pub async fn stat(&self, principal: &Principal, path: &str) -> Result<Authorized<FileStatus>, GatewayError> {
        let authorized = self
            .run("stat", principal, path, AccessLevel::Read, |routed| async move {
                let mut status = routed.backend.stat(&routed.relative).await?;
                status.path = routed.to_cluster(&status.path);
                Ok::<_, BackendError>(status)
            })
            .await?;

        let granted_level = authorized.granted_level;
        Ok(authorized.map(|mut status| {
            status.permission = Some(granted_level);
            status
        }))
    }

    pub async fn mkdir(&self, principal: &Principal, path: &str) -> Result<Authorized<()>, GatewayError> {
        self.run("mkdir", principal, path, AccessLevel::Write, |routed| async move {
            routed.backend.mkdir(&routed.relative).await
        })
        .await
    }

    pub async fn delete(&self, principal: &Principal, path: &str, recursive: bool) -> Result<Authorized<()>, GatewayError> {
        self.run("delete", principal, path, AccessLevel::Write, |routed| async move {
            routed.backend.delete(&routed.relative, recursive).await
        })
        .await
    }

    pub async fn disk_usage(&self, principal: &Principal, path: &str) -> Result<Authorized<DiskUsage>, GatewayError> {
        self.run("disk_usage", principal, path, AccessLevel::Read, |routed| async move {
            routed.backend.disk_usage(&routed.relative).await
        })
        .await
    }

    /// Move `from` to `to`; requires Write on both paths
    pub async fn rename(&self, principal: &Principal, from: &str, to: &str) -> Result<Authorized<()>, GatewayError> {
        let id = Uuid::new_v4();
        let span = info_span!("storage_operation", operation_id = %id, operation = "rename", principal = %principal);

        async move {
            let started = Instant::now();
            let result: Result<Authorized<()>, GatewayError> = async {
                let from = NormalizedPath::parse(from)?;
                let to = NormalizedPath::parse(to)?;
                debug!(phase = OperationPhase::Received.as_str(), from = %from, to = %to);

                let source = self.authorize_phase(principal, &from, AccessLevel::Write).await?;
                let target = self.authorize_phase(principal, &to, AccessLevel::Write).await?;

                let from_route = self.router.route(&from);
                let to_route = self.router.route(&to);
                if from_route.mount != to_route.mount {
                    return Err(GatewayError::Backend(BackendError::Unsupported(format!(
                        "cannot move {} across mounts ({} to {})",
                        from, from_route.mount, to_route.mount
                    ))));
                }

                debug!(phase = OperationPhase::Executing.as_str(), backend = from_route.backend.name());
                from_route
                    .backend
                    .rename(&from_route.relative, &to_route.relative)
                    .await
                    .map_err(|e| GatewayError::Backend(e.rebased(&from_route.mount)))?;

                Ok(Authorized {
                    value: (),
                    granted_level: source.granted_level.min(target.granted_level),
                    matched_prefix: source.matched_prefix,
                    warning: source.warning.or(target.warning),
                })
            }
            .await;

            self.complete("rename", &result, started);
            result
        }
        .instrument(span)
        .await
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        principal: &Principal,
        raw_path: &str,
        required: AccessLevel,
        f: F,
    ) -> Result<Authorized<T>, GatewayError>
    where
        F: FnOnce(Routed) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let id = Uuid::new_v4();
        let span = info_span!(
            "storage_operation",
            operation_id = %id,
            operation = operation,
            principal = %principal,
            level = %required
        );

        async move {
            let started = Instant::now();
            let result: Result<Authorized<T>, GatewayError> = async {
                let path = NormalizedPath::parse(raw_path)?;
                debug!(phase = OperationPhase::Received.as_str(), path = %path);

                let grant = self.authorize_phase(principal, &path, required).await?;

                let routed = self.router.route(&path);
                let mount = routed.mount.clone();
                debug!(
                    phase = OperationPhase::Executing.as_str(),
                    backend = routed.backend.name(),
                    mount = %mount
                );
                let value = f(routed).await.map_err(|e| GatewayError::Backend(e.rebased(&mount)))?;

                Ok(Authorized {
                    value,
                    granted_level: grant.granted_level,
                    matched_prefix: grant.matched_prefix,
                    warning: grant.warning,
                })
            }
            .await;

            self.complete(operation, &result, started);
            result
        }
        .instrument(span)
        .await
    }

    async fn authorize_phase(
        &self,
        principal: &Principal,
        path: &NormalizedPath,
        required: AccessLevel,
    ) -> Result<Grant, GatewayError> {
        debug!(phase = OperationPhase::Authorizing.as_str(), path = %path);

        let authorization = match self.authorizer.authorize_path(principal, path, required).await {
            Ok(authorization) => authorization,
            Err(error) => {
                warn!(
                    phase = OperationPhase::AuthorizationFailed.as_str(),
                    path = %path,
                    error = %error,
                    "Could not determine permissions"
                );
                return Err(error.into());
            }
        };

        match authorization.decision {
            AuthorizationDecision::Allowed {
                granted_level,
                matched_prefix,
            } => {
                let warning = (authorization.cache_state == CacheState::Stale).then(|| StaleServed {
                    matched_prefix: matched_prefix.clone(),
                });
                debug!(
                    phase = OperationPhase::Authorized.as_str(),
                    path = %path,
                    granted_level = %granted_level,
                    matched_prefix = %matched_prefix,
                    cache_state = %authorization.cache_state
                );
                Ok(Grant {
                    granted_level,
                    matched_prefix,
                    warning,
                })
            }
            AuthorizationDecision::Denied(reason) => {
                info!(
                    phase = OperationPhase::Denied.as_str(),
                    path = %path,
                    reason = %reason,
                    "Access denied"
                );
                Err(GatewayError::Denied {
                    path: path.clone(),
                    reason,
                })
            }
        }
    }

    fn complete<T>(&self, operation: &'static str, result: &Result<Authorized<T>, GatewayError>, started: Instant) {
        let elapsed = started.elapsed();
        let outcome = match result {
            Ok(authorized) if authorized.warning.is_some() => "ok_stale",
            Ok(_) => "ok",
            Err(error) => error.kind(),
        };
        record_storage_operation(operation, outcome, elapsed);
        debug!(
            phase = OperationPhase::Completed.as_str(),
            outcome = outcome,
            duration_ms = elapsed.as_millis() as u64
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::audit::TracingAuditSink;
    use crate::auth::cache::{CacheConfig, PermissionCache};
    use crate::services::authority::StaticAuthorityClient;
    use crate::services::storage::MemoryBackend;

    fn p(raw: &str) -> NormalizedPath {
        NormalizedPath::parse(raw).unwrap()
    }

    fn gateway(grants: Vec<(Principal, NormalizedPath, AccessLevel)>) -> (StorageGateway, Arc<MemoryBackend>) {
        let authority = Arc::new(StaticAuthorityClient::with_grants(grants));
        let cache = PermissionCache::new(CacheConfig::default(), authority).unwrap();
        let authorizer = PathAuthorizer::new(cache, Arc::new(TracingAuditSink));
        let backend = Arc::new(MemoryBackend::default());
        (StorageGateway::new(authorizer, BackendRouter::new(backend.clone())), backend)
    }

    #[tokio::test]
    async fn test_allowed_operations_reach_backend() {
        let alice = Principal::new("alice");
        let (gw, backend) = gateway(vec![(alice.clone(), NormalizedPath::root(), AccessLevel::Manage)]);

        gw.mkdir(&alice, "/org/proj").await.unwrap();
        gw.create(&alice, "/org/proj/a.txt", b"abc").await.unwrap();
        gw.write(&alice, "/org/proj/a.txt", 3, b"def").await.unwrap();

        let read = gw.read(&alice, "org/proj/a.txt", 0, None).await.unwrap();
        assert_eq!(read.value, b"abcdef");
        assert_eq!(read.granted_level, AccessLevel::Manage);
        assert_eq!(read.matched_prefix, NormalizedPath::root());
        assert!(read.warning.is_none());

        let stat = gw.stat(&alice, "/org/proj/a.txt").await.unwrap();
        assert_eq!(stat.value.permission, Some(AccessLevel::Manage));
        assert_eq!(stat.value.size, 6);
        assert_eq!(backend.operation_count(), 5);
    }

    #[tokio::test]
    async fn test_denied_operation_never_touches_backend() {
        let (gw, backend) = gateway(vec![(Principal::new("alice"), p("/docs"), AccessLevel::Read)]);

        let result = gw.write(&Principal::new("alice"), "/docs/x", 0, b"nope").await;
        assert!(matches!(
            result,
            Err(GatewayError::Denied {
                reason: DenyReason::InsufficientLevel { .. },
                ..
            })
        ));
        let result = gw.read(&Principal::new("mallory"), "/docs/x", 0, None).await;
        assert!(matches!(result, Err(GatewayError::Denied { .. })));
        assert_eq!(backend.operation_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_path_and_anonymous_rejected() {
        let (gw, backend) = gateway(vec![]);
        assert!(matches!(
            gw.read(&Principal::new("alice"), "/a/./b", 0, None).await,
            Err(GatewayError::InvalidPath(_))
        ));
        assert!(matches!(
            gw.list(&Principal::new(""), "/").await,
            Err(GatewayError::Unauthenticated)
        ));
        assert_eq!(backend.operation_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_errors_propagate_verbatim() {
        let alice = Principal::new("alice");
        let (gw, _) = gateway(vec![(alice.clone(), NormalizedPath::root(), AccessLevel::Write)]);

        let result = gw.read(&alice, "/missing", 0, None).await;
        assert!(matches!(result, Err(GatewayError::Backend(BackendError::NotFound(path))) if path == p("/missing")));
    }

    #[tokio::test]
    async fn test_rename_requires_write_on_both_paths() {
        let alice = Principal::new("alice");
        let (gw, _) = gateway(vec![
            (alice.clone(), p("/src"), AccessLevel::Write),
            (alice.clone(), p("/ro"), AccessLevel::Read),
        ]);
        gw.create(&alice, "/src/f", b"x").await.unwrap();

        let denied = gw.rename(&alice, "/src/f", "/ro/f").await;
        assert!(matches!(denied, Err(GatewayError::Denied { path, .. }) if path == p("/ro/f")));
    }
}
