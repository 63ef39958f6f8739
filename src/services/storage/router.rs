//! Mount table mapping cluster paths to backends
//!
//! Built once at startup and immutable afterwards. The longest mount prefix
//! containing a path wins; `/` is always mounted.

use std::sync::Arc;
use tracing::info;

use super::{LocalFsBackend, MemoryBackend, StorageBackend};
use crate::auth::path::NormalizedPath;
use crate::config::{StorageConfig, StorageMode};
use crate::error::AppError;

#[derive(Clone)]
struct Mount {
    prefix: NormalizedPath,
    backend: Arc<dyn StorageBackend>,
}

/// Where a cluster path lands
#[derive(Clone)]
pub struct Routed {
    pub mount: NormalizedPath,
    pub backend: Arc<dyn StorageBackend>,
    /// The path relative to the mount, as the backend sees it
    pub relative: NormalizedPath,
}

impl Routed {
    /// Map a backend path under this mount back into cluster terms
    pub fn to_cluster(&self, backend_path: &NormalizedPath) -> NormalizedPath {
        self.mount
            .join(backend_path.as_str())
            .unwrap_or_else(|_| backend_path.clone())
    }
}

#[derive(Clone)]
pub struct BackendRouter {
    root: Arc<dyn StorageBackend>,
    /// Mounts below `/`, deepest prefix first
    mounts: Vec<Mount>,
}

impl BackendRouter {
    pub fn new(root: Arc<dyn StorageBackend>) -> Self {
        Self {
            root,
            mounts: Vec::new(),
        }
    }

    pub fn with_mount(mut self, prefix: NormalizedPath, backend: Arc<dyn StorageBackend>) -> Result<Self, AppError> {
        if prefix.is_root() || self.mounts.iter().any(|m| m.prefix == prefix) {
            return Err(AppError::Config(format!("storage prefix {} is mounted twice", prefix)));
        }
        self.mounts.push(Mount { prefix, backend });
        self.mounts
            .sort_by(|a, b| b.prefix.depth().cmp(&a.prefix.depth()));
        Ok(self)
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, AppError> {
        let mut router = Self::new(build_backend("root", config.mode, &config.base_path));
        for mount in &config.mounts {
            let prefix = NormalizedPath::parse(&mount.prefix)
                .map_err(|e| AppError::Config(format!("invalid mount prefix {}: {}", mount.prefix, e)))?;
            let backend = build_backend(prefix.as_str(), mount.mode, &mount.base_path);
            router = router.with_mount(prefix, backend)?;
        }

        info!(prefix = "/", backend = router.root.name(), "Mounted storage backend");
        for mount in &router.mounts {
            info!(prefix = %mount.prefix, backend = mount.backend.name(), "Mounted storage backend");
        }
        Ok(router)
    }

    pub fn route(&self, path: &NormalizedPath) -> Routed {
        for mount in &self.mounts {
            if let Some(relative) = path.strip_prefix(&mount.prefix) {
                return Routed {
                    mount: mount.prefix.clone(),
                    backend: mount.backend.clone(),
                    relative,
                };
            }
        }
        Routed {
            mount: NormalizedPath::root(),
            backend: self.root.clone(),
            relative: path.clone(),
        }
    }

    /// Mounted prefixes, deepest first, ending with `/`
    pub fn prefixes(&self) -> Vec<NormalizedPath> {
        self.mounts
            .iter()
            .map(|m| m.prefix.clone())
            .chain(std::iter::once(NormalizedPath::root()))
            .collect()
    }
}

fn build_backend(name: &str, mode: StorageMode, base_path: &str) -> Arc<dyn StorageBackend> {
    match mode {
        StorageMode::Memory => Arc::new(MemoryBackend::new(name)),
        StorageMode::Local => Arc::new(LocalFsBackend::new(name, base_path)),
    }
}
