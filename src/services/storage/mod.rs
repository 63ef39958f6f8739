//! Storage backends behind the gateway
//!
//! Backends receive paths that are already authorized and already relative
//! to their mount point. They know nothing about principals or permissions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use thiserror::Error;

use crate::auth::path::NormalizedPath;
use crate::auth::types::AccessLevel;

pub mod local;
pub mod memory;
pub mod router;

pub use local::LocalFsBackend;
pub use memory::MemoryBackend;
pub use router::{BackendRouter, Routed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub path: NormalizedPath,
    pub size: u64,
    pub modification_time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// Caller's effective level, filled in by the gateway on `stat`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<AccessLevel>,
}

impl FileStatus {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    /// Bytes used under the requested path
    pub used: u64,
    /// Capacity of the backing volume, when the backend knows it
    pub total: Option<u64>,
    pub free: Option<u64>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(NormalizedPath),

    #[error("already exists: {0}")]
    AlreadyExists(NormalizedPath),

    #[error("not a directory: {0}")]
    NotADirectory(NormalizedPath),

    #[error("is a directory: {0}")]
    IsADirectory(NormalizedPath),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(NormalizedPath),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: NormalizedPath,
        #[source]
        source: io::Error,
    },
}

impl BackendError {
    pub fn from_io(path: &NormalizedPath, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => BackendError::NotFound(path.clone()),
            io::ErrorKind::AlreadyExists => BackendError::AlreadyExists(path.clone()),
            io::ErrorKind::NotADirectory => BackendError::NotADirectory(path.clone()),
            io::ErrorKind::IsADirectory => BackendError::IsADirectory(path.clone()),
            io::ErrorKind::DirectoryNotEmpty => BackendError::DirectoryNotEmpty(path.clone()),
            _ => BackendError::Io {
                path: path.clone(),
                source,
            },
        }
    }

    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::NotFound(_) => "not_found",
            BackendError::AlreadyExists(_) => "already_exists",
            BackendError::NotADirectory(_) => "not_a_directory",
            BackendError::IsADirectory(_) => "is_a_directory",
            BackendError::DirectoryNotEmpty(_) => "directory_not_empty",
            BackendError::Unsupported(_) => "unsupported",
            BackendError::Io { .. } => "io",
        }
    }

    /// Same error with paths reported in cluster terms instead of mount terms
    pub fn rebased(self, mount: &NormalizedPath) -> Self {
        let rebase = |path: NormalizedPath| mount.join(path.as_str()).unwrap_or(path);
        match self {
            BackendError::NotFound(p) => BackendError::NotFound(rebase(p)),
            BackendError::AlreadyExists(p) => BackendError::AlreadyExists(rebase(p)),
            BackendError::NotADirectory(p) => BackendError::NotADirectory(rebase(p)),
            BackendError::IsADirectory(p) => BackendError::IsADirectory(rebase(p)),
            BackendError::DirectoryNotEmpty(p) => BackendError::DirectoryNotEmpty(rebase(p)),
            BackendError::Io { path, source } => BackendError::Io {
                path: rebase(path),
                source,
            },
            other => other,
        }
    }
}

/// File operations over one backing store
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Read up to `size` bytes from `offset`; `None` reads to the end
    async fn read(&self, path: &NormalizedPath, offset: u64, size: Option<u64>) -> Result<Vec<u8>, BackendError>;

    /// Write `data` at `offset`, creating the file if missing and extending it as needed
    async fn write(&self, path: &NormalizedPath, offset: u64, data: &[u8]) -> Result<(), BackendError>;

    /// Create a new file; fails if anything exists at `path`
    async fn create(&self, path: &NormalizedPath, data: &[u8]) -> Result<(), BackendError>;

    /// Direct children of a directory, sorted by path
    async fn list(&self, path: &NormalizedPath) -> Result<Vec<FileStatus>, BackendError>;

    async fn stat(&self, path: &NormalizedPath) -> Result<FileStatus, BackendError>;

    /// Create a directory and any missing parents
    async fn mkdir(&self, path: &NormalizedPath) -> Result<(), BackendError>;

    async fn delete(&self, path: &NormalizedPath, recursive: bool) -> Result<(), BackendError>;

    async fn rename(&self, from: &NormalizedPath, to: &NormalizedPath) -> Result<(), BackendError>;

    async fn disk_usage(&self, path: &NormalizedPath) -> Result<DiskUsage, BackendError>;
}
