//! Path-based authorization
//!
//! Every storage operation names a path and an access level. The
//! [`authorizer::PathAuthorizer`] walks the path from its deepest prefix
//! upwards through the [`cache::PermissionCache`], which answers from
//! memory when it can and asks the permission authority when it must.

pub mod audit;
pub mod authorizer;
pub mod cache;
pub mod clock;
pub mod components;
pub mod path;
pub mod types;

pub use audit::{AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
pub use authorizer::{Authorization, AuthorizeError, PathAuthorizer};
pub use cache::{CacheConfig, CacheStats, Invalidation, PermissionCache};
pub use components::{AuthorizationComponents, AuthorizationStats};
pub use path::{NormalizedPath, PathError};
pub use types::*;
