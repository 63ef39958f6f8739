//! Shared fixtures for tests across modules

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::auth::audit::{AuditEvent, AuditSink};
use crate::auth::authorizer::PathAuthorizer;
use crate::auth::cache::{CacheConfig, PermissionCache};
use crate::auth::clock::ManualClock;
use crate::auth::components::AuthorizationComponents;
use crate::auth::path::NormalizedPath;
use crate::auth::types::{AccessLevel, Principal};
use crate::gateway::StorageGateway;
use crate::health::HealthManager;
use crate::server::AppState;
use crate::services::authority::StaticAuthorityClient;
use crate::services::storage::{BackendError, BackendRouter, DiskUsage, FileStatus, MemoryBackend, StorageBackend};

pub fn p(raw: &str) -> NormalizedPath {
    NormalizedPath::parse(raw).unwrap()
}

/// Keeps every audit event for inspection
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Memory backend whose reads park until released
///
/// `entered` fires once a read has started; the read then waits on
/// `release` before touching the data.
#[derive(Default)]
pub struct GatedBackend {
    pub inner: MemoryBackend,
    pub entered: Notify,
    pub release: Notify,
}

#[async_trait]
impl StorageBackend for GatedBackend {
    fn name(&self) -> &str {
        "gated"
    }

    async fn read(&self, path: &NormalizedPath, offset: u64, size: Option<u64>) -> Result<Vec<u8>, BackendError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.read(path, offset, size).await
    }

    async fn write(&self, path: &NormalizedPath, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        self.inner.write(path, offset, data).await
    }

    async fn create(&self, path: &NormalizedPath, data: &[u8]) -> Result<(), BackendError> {
        self.inner.create(path, data).await
    }

    async fn list(&self, path: &NormalizedPath) -> Result<Vec<FileStatus>, BackendError> {
        self.inner.list(path).await
    }

    async fn stat(&self, path: &NormalizedPath) -> Result<FileStatus, BackendError> {
        self.inner.stat(path).await
    }

    async fn mkdir(&self, path: &NormalizedPath) -> Result<(), BackendError> {
        self.inner.mkdir(path).await
    }

    async fn delete(&self, path: &NormalizedPath, recursive: bool) -> Result<(), BackendError> {
        self.inner.delete(path, recursive).await
    }

    async fn rename(&self, from: &NormalizedPath, to: &NormalizedPath) -> Result<(), BackendError> {
        self.inner.rename(from, to).await
    }

    async fn disk_usage(&self, path: &NormalizedPath) -> Result<DiskUsage, BackendError> {
        self.inner.disk_usage(path).await
    }
}

/// Gateway over a single backend with a hand-driven clock
pub struct GatewayFixture<B> {
    pub gateway: StorageGateway,
    pub cache: PermissionCache,
    pub authority: Arc<StaticAuthorityClient>,
    pub backend: Arc<B>,
    pub audit: Arc<RecordingAuditSink>,
    pub clock: ManualClock,
}

pub fn gateway_fixture<B>(backend: Arc<B>, grants: Vec<(Principal, NormalizedPath, AccessLevel)>) -> GatewayFixture<B>
where
    B: StorageBackend + 'static,
{
    let authority = Arc::new(StaticAuthorityClient::with_grants(grants));
    let clock = ManualClock::new();
    let config = CacheConfig {
        authority_timeout: std::time::Duration::from_millis(500),
        ..CacheConfig::default()
    };
    let cache = PermissionCache::with_clock(config, authority.clone(), Arc::new(clock.clone())).unwrap();
    let audit = Arc::new(RecordingAuditSink::default());
    let authorizer = PathAuthorizer::new(cache.clone(), audit.clone());
    let gateway = StorageGateway::new(authorizer, BackendRouter::new(backend.clone()));

    GatewayFixture {
        gateway,
        cache,
        authority,
        backend,
        audit,
        clock,
    }
}

/// Server state backed by a static authority granting alice Manage on `/`
pub fn static_state(health: HealthManager) -> AppState {
    let authority = Arc::new(StaticAuthorityClient::with_grants(vec![(
        Principal::new("alice"),
        NormalizedPath::root(),
        AccessLevel::Manage,
    )]));
    let authorization =
        AuthorizationComponents::with_client(authority, CacheConfig::default(), Arc::new(RecordingAuditSink::default()))
            .unwrap();
    let gateway = StorageGateway::new(
        authorization.authorizer.clone(),
        BackendRouter::new(Arc::new(MemoryBackend::default())),
    );

    AppState {
        health,
        authorization,
        gateway,
        metrics: None,
    }
}
