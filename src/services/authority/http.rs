//! HTTP client for the platform permission authority
//!
//! Asks the auth service for the caller's whole permission tree rooted at the
//! requested storage URI:
//!
//! ```text
//! GET {endpoint}/api/v1/users/{principal}/permissions/tree?uri=storage://{cluster}{path}
//! Authorization: Bearer {token}
//!
//! 200 {"path": "/org", "action": "list",
//!      "children": {"proj": {"path": "/org/proj", "action": "write", "children": {}}}}
//! ```
//!
//! `read`, `write` and `manage` are grants. `deny` and `list` (visible but
//! not readable) are denials. 403 and 404 responses deny the whole subtree.
//! The principal is sent as a single percent-encoded path segment.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::collections::BTreeMap;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{AuthorityError, AuthorityStats, PermissionAuthorityClient};
use crate::auth::path::NormalizedPath;
use crate::auth::types::{AccessLevel, AuthorityVerdict, PermissionTree, Principal};
use crate::logging::sanitize_log_message;

#[derive(Clone, Debug)]
pub struct HttpAuthorityConfig {
    /// Base URL of the auth service, e.g. `http://platformauthapi:8080`
    pub endpoint: String,
    /// Service token sent as a bearer credential
    pub token: String,
    /// Cluster name used to build `storage://` URIs
    pub cluster_name: String,
    pub connect_timeout: Duration,
}

impl Default for HttpAuthorityConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            token: String::new(),
            cluster_name: "default".to_string(),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Node of the permission tree returned by the auth service
#[derive(Debug, Deserialize)]
struct PermissionTreeResponse {
    action: String,
    #[serde(default)]
    children: BTreeMap<String, PermissionTreeResponse>,
}

impl PermissionTreeResponse {
    fn into_tree(self) -> Result<PermissionTree, AuthorityError> {
        let verdict = parse_action(&self.action)?;
        let children = self
            .children
            .into_iter()
            .map(|(name, child)| child.into_tree().map(|tree| (name, tree)))
            .collect::<Result<BTreeMap<_, _>, AuthorityError>>()?;
        Ok(PermissionTree { verdict, children })
    }
}

pub struct HttpAuthorityClient {
    http: reqwest::Client,
    base_url: Url,
    config: HttpAuthorityConfig,
    stats: RwLock<AuthorityStats>,
}

impl HttpAuthorityClient {
    pub fn new(config: HttpAuthorityConfig) -> Result<Self, AuthorityError> {
        if config.endpoint.is_empty() {
            return Err(AuthorityError::Unreachable("authority endpoint is empty".to_string()));
        }
        let base_url = Url::parse(&config.endpoint)
            .map_err(|e| AuthorityError::Unreachable(format!("invalid authority endpoint: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AuthorityError::Unreachable(format!(
                "authority endpoint {} cannot carry a path",
                config.endpoint
            )));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AuthorityError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        info!(
            endpoint = %config.endpoint,
            cluster = %config.cluster_name,
            "HTTP permission authority client created"
        );

        Ok(Self {
            http,
            base_url,
            config,
            stats: RwLock::new(AuthorityStats::default()),
        })
    }

    /// `storage://{cluster}{path}` for a normalized path
    pub fn storage_uri(&self, path: &NormalizedPath) -> String {
        if path.is_root() {
            format!("storage://{}", self.config.cluster_name)
        } else {
            format!("storage://{}{}", self.config.cluster_name, path)
        }
    }

    /// Endpoint URL under the configured base, one percent-encoded segment each
    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// `None` for names that cannot be a path segment
    pub fn tree_url(&self, principal: &Principal) -> Option<Url> {
        if matches!(principal.as_str(), "." | "..") {
            return None;
        }
        Some(self.api_url(&["api", "v1", "users", principal.as_str(), "permissions", "tree"]))
    }

    async fn fetch_tree(
        &self,
        principal: &Principal,
        prefix: &NormalizedPath,
        timeout: Duration,
    ) -> Result<PermissionTree, AuthorityError> {
        let Some(url) = self.tree_url(principal) else {
            warn!(principal = %principal, "Principal name cannot be addressed at the authority, denying");
            return Ok(PermissionTree::new(AuthorityVerdict::Deny));
        };

        let uri = self.storage_uri(prefix);
        let mut request = self
            .http
            .get(url)
            .query(&[("uri", uri.as_str())])
            .timeout(timeout);
        if !self.config.token.is_empty() {
            request = request.bearer_auth(&self.config.token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AuthorityError::Timeout
            } else {
                AuthorityError::Unreachable(sanitize_log_message(&e.to_string()))
            }
        })?;

        match response.status() {
            status if status.is_success() => {
                let body = response.text().await.map_err(|e| {
                    if e.is_timeout() {
                        AuthorityError::Timeout
                    } else {
                        AuthorityError::Unreachable(sanitize_log_message(&e.to_string()))
                    }
                })?;
                let tree: PermissionTreeResponse = serde_json::from_str(&body)
                    .map_err(|e| AuthorityError::MalformedResponse(e.to_string()))?;
                tree.into_tree()
            }
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(PermissionTree::new(AuthorityVerdict::Deny)),
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    status = %status,
                    body = %sanitize_log_message(&body),
                    "Permission authority returned an error status"
                );
                Err(AuthorityError::Unreachable(format!("authority responded with {}", status)))
            }
        }
    }
}

/// Map an auth service action onto a verdict
fn parse_action(action: &str) -> Result<AuthorityVerdict, AuthorityError> {
    match action {
        "deny" | "list" => Ok(AuthorityVerdict::Deny),
        other => other
            .parse::<AccessLevel>()
            .map(AuthorityVerdict::Allow)
            .map_err(AuthorityError::MalformedResponse),
    }
}

#[async_trait]
impl PermissionAuthorityClient for HttpAuthorityClient {
    async fn check(
        &self,
        principal: &Principal,
        prefix: &NormalizedPath,
        level: AccessLevel,
        timeout: Duration,
    ) -> Result<PermissionTree, AuthorityError> {
        let start = Instant::now();
        debug!(principal = %principal, prefix = %prefix, level = %level, "Querying permission authority");

        let result = self.fetch_tree(principal, prefix, timeout).await;

        self.stats.write().await.record(&result, start.elapsed());
        result
    }

    async fn health_check(&self) -> Result<bool, AuthorityError> {
        let response = self
            .http
            .get(self.api_url(&["api", "v1", "ping"]))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| AuthorityError::Unreachable(sanitize_log_message(&e.to_string())))?;
        Ok(response.status().is_success())
    }

    async fn stats(&self) -> AuthorityStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::net::SocketAddr;

    async fn tree_handler(
        Path(user): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> axum::response::Response {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer secret") {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        // Trees must cover the full subtree
        if params.contains_key("depth") {
            return AxumStatus::BAD_REQUEST.into_response();
        }
        let uri = params.get("uri").cloned().unwrap_or_default();
        match (user.as_str(), uri.as_str()) {
            ("alice", "storage://test/org/proj") => {
                Json(serde_json::json!({"path": "/org/proj", "action": "write", "children": {}})).into_response()
            }
            ("alice", "storage://test/org") => Json(serde_json::json!({
                "path": "/org",
                "action": "list",
                "children": {
                    "proj": {
                        "path": "/org/proj",
                        "action": "write",
                        "children": {
                            "secret": {"path": "/org/proj/secret", "action": "deny", "children": {}}
                        }
                    }
                }
            }))
            .into_response(),
            ("bob/../alice?admin=1#x", "storage://test/org/proj") => {
                Json(serde_json::json!({"path": "/org/proj", "action": "read", "children": {}})).into_response()
            }
            ("alice", "storage://test/garbled") => "not json".into_response(),
            ("alice", "storage://test/broken") => AxumStatus::INTERNAL_SERVER_ERROR.into_response(),
            ("alice", "storage://test/slow") => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Json(serde_json::json!({"action": "read"})).into_response()
            }
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn spawn_fake_authority() -> SocketAddr {
        let app = Router::new()
            .route("/api/v1/users/{user}/permissions/tree", get(tree_handler))
            .route("/api/v1/ping", get(|| async { "Pong" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client_for(addr: SocketAddr, token: &str) -> HttpAuthorityClient {
        HttpAuthorityClient::new(HttpAuthorityConfig {
            endpoint: format!("http://{}", addr),
            token: token.to_string(),
            cluster_name: "test".to_string(),
            connect_timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    fn p(raw: &str) -> NormalizedPath {
        NormalizedPath::parse(raw).unwrap()
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn test_parse_action() {
        assert_eq!(parse_action("manage"), Ok(AuthorityVerdict::Allow(AccessLevel::Manage)));
        assert_eq!(parse_action("read"), Ok(AuthorityVerdict::Allow(AccessLevel::Read)));
        assert_eq!(parse_action("list"), Ok(AuthorityVerdict::Deny));
        assert_eq!(parse_action("deny"), Ok(AuthorityVerdict::Deny));
        assert!(matches!(parse_action("own"), Err(AuthorityError::MalformedResponse(_))));
    }

    #[test]
    fn test_storage_uri() {
        let client = HttpAuthorityClient::new(HttpAuthorityConfig {
            cluster_name: "prod".to_string(),
            ..HttpAuthorityConfig::default()
        })
        .unwrap();
        assert_eq!(client.storage_uri(&p("/org/proj")), "storage://prod/org/proj");
        assert_eq!(client.storage_uri(&NormalizedPath::root()), "storage://prod");
    }

    #[tokio::test]
    async fn test_grant_and_list_only_responses() {
        let addr = spawn_fake_authority().await;
        let client = client_for(addr, "secret");
        let alice = Principal::new("alice");

        let granted = client.check(&alice, &p("/org/proj"), AccessLevel::Read, TIMEOUT).await;
        assert_eq!(granted, Ok(PermissionTree::new(AuthorityVerdict::Allow(AccessLevel::Write))));

        let list_only = client.check(&alice, &p("/org"), AccessLevel::Read, TIMEOUT).await.unwrap();
        assert_eq!(list_only.verdict, AuthorityVerdict::Deny);

        let not_found = client.check(&Principal::new("bob"), &p("/org/proj"), AccessLevel::Read, TIMEOUT).await;
        assert_eq!(not_found, Ok(PermissionTree::new(AuthorityVerdict::Deny)));

        let stats = client.stats().await;
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 2);
    }

    #[tokio::test]
    async fn test_subtree_is_parsed_with_nested_exceptions() {
        let addr = spawn_fake_authority().await;
        let client = client_for(addr, "secret");

        let tree = client
            .check(&Principal::new("alice"), &p("/org"), AccessLevel::Read, TIMEOUT)
            .await
            .unwrap();
        let expected = PermissionTree::new(AuthorityVerdict::Deny).with_child(
            "proj",
            PermissionTree::new(AuthorityVerdict::Allow(AccessLevel::Write))
                .with_child("secret", PermissionTree::new(AuthorityVerdict::Deny)),
        );
        assert_eq!(tree, expected);
        assert_eq!(
            tree.resolve(&p("/org"), &p("/org/proj/secret/key")),
            Some((AuthorityVerdict::Deny, p("/org/proj/secret")))
        );
    }

    #[test]
    fn test_principal_is_a_single_encoded_segment() {
        let client = HttpAuthorityClient::new(HttpAuthorityConfig {
            endpoint: "http://auth.local/base/".to_string(),
            ..HttpAuthorityConfig::default()
        })
        .unwrap();

        let url = client.tree_url(&Principal::new("bob/../alice?admin=1#x")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://auth.local/base/api/v1/users/bob%2F..%2Falice%3Fadmin=1%23x/permissions/tree"
        );
        assert!(client.tree_url(&Principal::new("..")).is_none());
    }

    #[tokio::test]
    async fn test_principal_with_separators_reaches_its_own_tree() {
        let addr = spawn_fake_authority().await;
        let client = client_for(addr, "secret");

        let odd = client
            .check(&Principal::new("bob/../alice?admin=1#x"), &p("/org/proj"), AccessLevel::Read, TIMEOUT)
            .await;
        assert_eq!(odd, Ok(PermissionTree::new(AuthorityVerdict::Allow(AccessLevel::Read))));

        let dots = client.check(&Principal::new(".."), &p("/org/proj"), AccessLevel::Read, TIMEOUT).await;
        assert_eq!(dots, Ok(PermissionTree::new(AuthorityVerdict::Deny)));
        assert_eq!(client.stats().await.allowed, 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let addr = spawn_fake_authority().await;
        let client = client_for(addr, "secret");
        let alice = Principal::new("alice");

        let garbled = client.check(&alice, &p("/garbled"), AccessLevel::Read, TIMEOUT).await;
        assert!(matches!(garbled, Err(AuthorityError::MalformedResponse(_))));

        let broken = client.check(&alice, &p("/broken"), AccessLevel::Read, TIMEOUT).await;
        assert!(matches!(broken, Err(AuthorityError::Unreachable(_))));

        let slow = client
            .check(&alice, &p("/slow"), AccessLevel::Read, Duration::from_millis(50))
            .await;
        assert_eq!(slow, Err(AuthorityError::Timeout));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_not_a_denial() {
        let addr = spawn_fake_authority().await;
        let client = client_for(addr, "wrong");

        let result = client
            .check(&Principal::new("alice"), &p("/org/proj"), AccessLevel::Read, TIMEOUT)
            .await;
        assert!(matches!(result, Err(AuthorityError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(addr, "secret");
        let result = client
            .check(&Principal::new("alice"), &p("/org"), AccessLevel::Read, TIMEOUT)
            .await;
        assert!(matches!(result, Err(AuthorityError::Unreachable(_))));
        assert!(client.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_health_check() {
        let addr = spawn_fake_authority().await;
        let client = client_for(addr, "secret");
        assert_eq!(client.health_check().await, Ok(true));
    }
}
