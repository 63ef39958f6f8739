use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::path::NormalizedPath;
use super::types::{AccessLevel, CacheState, Principal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    /// No decision could be made; the request was refused
    Unavailable,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Allowed => "allowed",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub principal: Principal,
    pub path: NormalizedPath,
    pub access_level: AccessLevel,
    pub outcome: AuditOutcome,
    /// Prefix whose permission governed the decision
    pub matched_prefix: Option<NormalizedPath>,
    pub cache_state: Option<CacheState>,
    pub duration_ms: u64,
}

/// Destination for authorization decisions
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes every decision as a structured log line on the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let matched_prefix = event.matched_prefix.as_ref().map(|p| p.as_str()).unwrap_or("-");
        let cache_state = event.cache_state.map(|s| s.as_str()).unwrap_or("-");

        match event.outcome {
            AuditOutcome::Unavailable => warn!(
                target: "audit",
                audit_type = "authorization",
                principal = %event.principal,
                path = %event.path,
                access_level = %event.access_level,
                outcome = event.outcome.as_str(),
                duration_ms = event.duration_ms,
                "Authorization unavailable, request refused"
            ),
            _ => info!(
                target: "audit",
                audit_type = "authorization",
                principal = %event.principal,
                path = %event.path,
                access_level = %event.access_level,
                outcome = event.outcome.as_str(),
                matched_prefix = matched_prefix,
                cache_state = cache_state,
                duration_ms = event.duration_ms,
                "Authorization decision"
            ),
        }
    }
}
