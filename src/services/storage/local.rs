use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{BackendError, DiskUsage, FileStatus, FileType, StorageBackend};
use crate::auth::path::NormalizedPath;

/// Backend over a directory of a locally mounted filesystem
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    name: String,
    base: PathBuf,
}

impl LocalFsBackend {
    pub fn new(name: impl Into<String>, base: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Normalized paths carry no `.`/`..` segments, so this stays under `base`
    fn physical(&self, path: &NormalizedPath) -> PathBuf {
        if path.is_root() {
            self.base.clone()
        } else {
            self.base.join(path.as_str().trim_start_matches('/'))
        }
    }

    async fn metadata(&self, path: &NormalizedPath) -> Result<Metadata, BackendError> {
        fs::metadata(self.physical(path))
            .await
            .map_err(|e| BackendError::from_io(path, e))
    }
}

fn to_status(path: NormalizedPath, metadata: &Metadata) -> FileStatus {
    let modification_time = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let (file_type, size) = if metadata.is_dir() {
        (FileType::Directory, 0)
    } else {
        (FileType::File, metadata.len())
    };
    FileStatus {
        path,
        size,
        modification_time,
        file_type,
        permission: None,
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, path: &NormalizedPath, offset: u64, size: Option<u64>) -> Result<Vec<u8>, BackendError> {
        if self.metadata(path).await?.is_dir() {
            return Err(BackendError::IsADirectory(path.clone()));
        }
        let io_err = |e: std::io::Error| BackendError::from_io(path, e);

        let mut file = fs::File::open(self.physical(path)).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;

        let mut buffer = Vec::new();
        match size {
            Some(size) => file.take(size).read_to_end(&mut buffer).await.map_err(io_err)?,
            None => file.read_to_end(&mut buffer).await.map_err(io_err)?,
        };
        Ok(buffer)
    }

    async fn write(&self, path: &NormalizedPath, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        let io_err = |e: std::io::Error| BackendError::from_io(path, e);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.physical(path))
            .await
            .map_err(io_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        file.write_all(data).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }

    async fn create(&self, path: &NormalizedPath, data: &[u8]) -> Result<(), BackendError> {
        let io_err = |e: std::io::Error| BackendError::from_io(path, e);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.physical(path))
            .await
            .map_err(io_err)?;
        file.write_all(data).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }

    async fn list(&self, path: &NormalizedPath) -> Result<Vec<FileStatus>, BackendError> {
        if !self.metadata(path).await?.is_dir() {
            return Err(BackendError::NotADirectory(path.clone()));
        }
        let io_err = |e: std::io::Error| BackendError::from_io(path, e);

        let mut entries = fs::read_dir(self.physical(path)).await.map_err(io_err)?;
        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                debug!(entry = ?file_name, "Skipping entry with non UTF-8 name");
                continue;
            };
            let Ok(child) = path.join(name) else {
                continue;
            };
            let metadata = entry.metadata().await.map_err(io_err)?;
            listing.push(to_status(child, &metadata));
        }
        listing.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listing)
    }

    async fn stat(&self, path: &NormalizedPath) -> Result<FileStatus, BackendError> {
        let metadata = self.metadata(path).await?;
        Ok(to_status(path.clone(), &metadata))
    }

    async fn mkdir(&self, path: &NormalizedPath) -> Result<(), BackendError> {
        fs::create_dir_all(self.physical(path))
            .await
            .map_err(|e| BackendError::from_io(path, e))
    }

    async fn delete(&self, path: &NormalizedPath, recursive: bool) -> Result<(), BackendError> {
        if path.is_root() {
            return Err(BackendError::Unsupported("cannot delete the root directory".to_string()));
        }
        let physical = self.physical(path);
        let result = if self.metadata(path).await?.is_dir() {
            if recursive {
                fs::remove_dir_all(&physical).await
            } else {
                fs::remove_dir(&physical).await
            }
        } else {
            fs::remove_file(&physical).await
        };
        result.map_err(|e| BackendError::from_io(path, e))
    }

    async fn rename(&self, from: &NormalizedPath, to: &NormalizedPath) -> Result<(), BackendError> {
        if from.is_root() || to.starts_with(from) {
            return Err(BackendError::Unsupported(format!("cannot move {} into {}", from, to)));
        }
        self.metadata(from).await?;
        if fs::try_exists(self.physical(to))
            .await
            .map_err(|e| BackendError::from_io(to, e))?
        {
            return Err(BackendError::AlreadyExists(to.clone()));
        }
        fs::rename(self.physical(from), self.physical(to))
            .await
            .map_err(|e| BackendError::from_io(to, e))
    }

    async fn disk_usage(&self, path: &NormalizedPath) -> Result<DiskUsage, BackendError> {
        let root = self.metadata(path).await?;
        if !root.is_dir() {
            return Ok(DiskUsage {
                used: root.len(),
                total: None,
                free: None,
            });
        }

        let io_err = |e: std::io::Error| BackendError::from_io(path, e);
        let mut used = 0u64;
        let mut pending = vec![self.physical(path)];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(io_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
                let file_type = entry.file_type().await.map_err(io_err)?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    used += entry.metadata().await.map_err(io_err)?.len();
                }
            }
        }

        Ok(DiskUsage {
            used,
            total: None,
            free: None,
        })
    }
}
