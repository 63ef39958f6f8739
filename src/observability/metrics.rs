//! Prometheus metrics with cardinality controls
//!
//! Covers HTTP requests, authorization checks, the permission cache, calls to
//! the permission authority and storage operations.
//!
//! # Cardinality Control
//!
//! - Principals and full paths never appear in labels
//! - Status codes bucketed (2xx, 3xx, 4xx, 5xx)
//! - HTTP route labels capped; overflow is reported as "other"
//!
//! All recording functions are synchronous and cheap. Without an installed
//! recorder they are no-ops.

use metrics::{counter, gauge, histogram};
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::auth::audit::AuditOutcome;
use crate::auth::types::{AccessLevel, CacheState, PermissionTree};
use crate::services::authority::AuthorityError;

const MAX_ROUTE_LABELS: usize = 50;

/// Cardinality limiter to prevent metric explosion
pub struct CardinalityLimiter {
    max_labels: usize,
    labels: Mutex<HashSet<String>>,
}

impl CardinalityLimiter {
    pub fn new(max_labels: usize) -> Self {
        Self {
            max_labels,
            labels: Mutex::new(HashSet::new()),
        }
    }

    /// Label as given, or "other" once the limit is reached
    pub fn label(&self, value: &str) -> String {
        let Ok(mut labels) = self.labels.lock() else {
            return "other".to_string();
        };
        if labels.contains(value) {
            return value.to_string();
        }
        if labels.len() < self.max_labels {
            labels.insert(value.to_string());
            return value.to_string();
        }
        "other".to_string()
    }

    pub fn label_count(&self) -> usize {
        self.labels.lock().map(|labels| labels.len()).unwrap_or(0)
    }
}

fn route_limiter() -> &'static CardinalityLimiter {
    static LIMITER: OnceLock<CardinalityLimiter> = OnceLock::new();
    LIMITER.get_or_init(|| CardinalityLimiter::new(MAX_ROUTE_LABELS))
}

/// Bucket HTTP status codes to control cardinality
pub fn bucket_status_code(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_http_request(method: &str, route: &str, status: u16, duration: Duration) {
    let route = route_limiter().label(route);
    let status = bucket_status_code(status);

    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);

    histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "route" => route,
        "status" => status
    )
    .record(duration.as_secs_f64());
}

/// One authorization decision, including fail-closed outcomes
pub fn record_authorization_check(
    level: AccessLevel,
    outcome: AuditOutcome,
    cache_state: Option<CacheState>,
    duration: Duration,
) {
    let cache_state = cache_state.map(|s| s.as_str()).unwrap_or("none");

    counter!(
        "authorization_checks_total",
        "level" => level.as_str(),
        "outcome" => outcome.as_str(),
        "cache_state" => cache_state
    )
    .increment(1);

    histogram!(
        "authorization_duration_seconds",
        "outcome" => outcome.as_str()
    )
    .record(duration.as_secs_f64());
}

pub fn record_cache_lookup(state: CacheState) {
    counter!("permission_cache_lookups_total", "state" => state.as_str()).increment(1);
}

pub fn update_cache_entries(entries: usize) {
    gauge!("permission_cache_entries").set(entries as f64);
}

/// Outcome is the verdict at the root of the returned tree
pub fn record_authority_request(result: &Result<PermissionTree, AuthorityError>, duration: Duration) {
    let outcome = match result {
        Ok(tree) if tree.verdict.is_allow() => "allow",
        Ok(_) => "deny",
        Err(error) => error.kind(),
    };

    counter!("authority_requests_total", "outcome" => outcome).increment(1);
    histogram!("authority_request_duration_seconds", "outcome" => outcome).record(duration.as_secs_f64());
}

/// `outcome` is "ok", "denied", "unavailable" or a backend error kind
pub fn record_storage_operation(operation: &'static str, outcome: &'static str, duration: Duration) {
    counter!(
        "storage_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);

    histogram!(
        "storage_operation_duration_seconds",
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::AuthorityVerdict;
    use crate::config::Environment;
    use crate::observability::recorder::build_recorder;

    #[test]
    fn test_status_code_bucketing() {
        assert_eq!(bucket_status_code(200), "2xx");
        assert_eq!(bucket_status_code(204), "2xx");
        assert_eq!(bucket_status_code(301), "3xx");
        assert_eq!(bucket_status_code(403), "4xx");
        assert_eq!(bucket_status_code(503), "5xx");
        assert_eq!(bucket_status_code(100), "other");
    }

    #[test]
    fn test_cardinality_limiter_overflows_to_other() {
        let limiter = CardinalityLimiter::new(2);
        assert_eq!(limiter.label("/health"), "/health");
        assert_eq!(limiter.label("/metrics"), "/metrics");
        assert_eq!(limiter.label("/files"), "other");
        assert_eq!(limiter.label("/health"), "/health");
        assert_eq!(limiter.label_count(), 2);
    }

    #[test]
    fn test_recorded_metrics_are_rendered() {
        let recorder = build_recorder(Environment::Development);
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_authorization_check(
                AccessLevel::Write,
                AuditOutcome::Denied,
                Some(CacheState::Stale),
                Duration::from_millis(3),
            );
            record_authorization_check(
                AccessLevel::Read,
                AuditOutcome::Unavailable,
                None,
                Duration::from_millis(5),
            );
            record_cache_lookup(CacheState::Miss);
            record_authority_request(&Err(AuthorityError::Timeout), Duration::from_millis(50));
            record_authority_request(
                &Ok(PermissionTree::new(AuthorityVerdict::Allow(AccessLevel::Read))),
                Duration::from_millis(1),
            );
            record_storage_operation("read", "ok", Duration::from_millis(2));
            update_cache_entries(7);
        });

        let output = handle.render();
        assert!(output.contains("authorization_checks_total"));
        assert!(output.contains("outcome=\"denied\""));
        assert!(output.contains("cache_state=\"stale\""));
        assert!(output.contains("cache_state=\"none\""));
        assert!(output.contains("permission_cache_lookups_total"));
        assert!(output.contains("state=\"miss\""));
        assert!(output.contains("outcome=\"timeout\""));
        assert!(output.contains("outcome=\"allow\""));
        assert!(output.contains("storage_operations_total"));
        assert!(output.contains("permission_cache_entries"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_cache_lookup(CacheState::Fresh);
        record_http_request("GET", "/health", 200, Duration::from_millis(1));
    }
}
