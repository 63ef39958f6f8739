use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{BackendError, DiskUsage, FileStatus, FileType, StorageBackend};
use crate::auth::path::NormalizedPath;

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, modified: DateTime<Utc> },
    Directory { modified: DateTime<Utc> },
}

impl Node {
    fn status(&self, path: &NormalizedPath) -> FileStatus {
        match self {
            Node::File { data, modified } => FileStatus {
                path: path.clone(),
                size: data.len() as u64,
                modification_time: *modified,
                file_type: FileType::File,
                permission: None,
            },
            Node::Directory { modified } => FileStatus {
                path: path.clone(),
                size: 0,
                modification_time: *modified,
                file_type: FileType::Directory,
                permission: None,
            },
        }
    }
}

/// In-process backend keeping the whole tree in a map
///
/// Used for `storage.mode = "memory"` and in tests, where
/// [`MemoryBackend::operation_count`] shows whether a request reached storage.
pub struct MemoryBackend {
    name: String,
    nodes: RwLock<BTreeMap<NormalizedPath, Node>>,
    operations: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(NormalizedPath::root(), Node::Directory { modified: Utc::now() });
        Self {
            name: name.into(),
            nodes: RwLock::new(nodes),
            operations: AtomicU64::new(0),
        }
    }

    /// Number of operations served so far
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.operations.fetch_add(1, Ordering::SeqCst);
    }
}

fn require_parent_dir(nodes: &BTreeMap<NormalizedPath, Node>, path: &NormalizedPath) -> Result<(), BackendError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    match nodes.get(&parent) {
        Some(Node::Directory { .. }) => Ok(()),
        Some(Node::File { .. }) => Err(BackendError::NotADirectory(parent)),
        None => Err(BackendError::NotFound(parent)),
    }
}

fn require_dir<'a>(nodes: &'a BTreeMap<NormalizedPath, Node>, path: &NormalizedPath) -> Result<&'a Node, BackendError> {
    match nodes.get(path) {
        Some(node @ Node::Directory { .. }) => Ok(node),
        Some(Node::File { .. }) => Err(BackendError::NotADirectory(path.clone())),
        None => Err(BackendError::NotFound(path.clone())),
    }
}

fn subtree(nodes: &BTreeMap<NormalizedPath, Node>, root: &NormalizedPath) -> Vec<NormalizedPath> {
    nodes.keys().filter(|p| p.starts_with(root)).cloned().collect()
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, path: &NormalizedPath, offset: u64, size: Option<u64>) -> Result<Vec<u8>, BackendError> {
        self.count();
        let nodes = self.nodes.read().await;
        match nodes.get(path) {
            Some(Node::File { data, .. }) => {
                let len = data.len() as u64;
                let start = offset.min(len);
                let end = size.map_or(len, |size| start.saturating_add(size).min(len));
                Ok(data[start as usize..end as usize].to_vec())
            }
            Some(Node::Directory { .. }) => Err(BackendError::IsADirectory(path.clone())),
            None => Err(BackendError::NotFound(path.clone())),
        }
    }

    async fn write(&self, path: &NormalizedPath, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
        self.count();
        let mut nodes = self.nodes.write().await;
        require_parent_dir(&nodes, path)?;

        let node = nodes.entry(path.clone()).or_insert_with(|| Node::File {
            data: Vec::new(),
            modified: Utc::now(),
        });
        match node {
            Node::File { data, modified } => {
                let start = offset as usize;
                let end = start + bytes.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(bytes);
                *modified = Utc::now();
                Ok(())
            }
            Node::Directory { .. } => Err(BackendError::IsADirectory(path.clone())),
        }
    }

    async fn create(&self, path: &NormalizedPath, bytes: &[u8]) -> Result<(), BackendError> {
        self.count();
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(path) {
            return Err(BackendError::AlreadyExists(path.clone()));
        }
        require_parent_dir(&nodes, path)?;
        nodes.insert(
            path.clone(),
            Node::File {
                data: bytes.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list(&self, path: &NormalizedPath) -> Result<Vec<FileStatus>, BackendError> {
        self.count();
        let nodes = self.nodes.read().await;
        require_dir(&nodes, path)?;
        Ok(nodes
            .iter()
            .filter(|(child, _)| child.parent().as_ref() == Some(path))
            .map(|(child, node)| node.status(child))
            .collect())
    }

    async fn stat(&self, path: &NormalizedPath) -> Result<FileStatus, BackendError> {
        self.count();
        let nodes = self.nodes.read().await;
        nodes
            .get(path)
            .map(|node| node.status(path))
            .ok_or_else(|| BackendError::NotFound(path.clone()))
    }

    async fn mkdir(&self, path: &NormalizedPath) -> Result<(), BackendError> {
        self.count();
        let mut nodes = self.nodes.write().await;
        let mut chain: Vec<NormalizedPath> = path.ancestors().collect();
        chain.reverse();

        for dir in chain {
            match nodes.get(&dir) {
                Some(Node::Directory { .. }) => {}
                Some(Node::File { .. }) => return Err(BackendError::NotADirectory(dir)),
                None => {
                    nodes.insert(dir, Node::Directory { modified: Utc::now() });
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &NormalizedPath, recursive: bool) -> Result<(), BackendError> {
        self.count();
        if path.is_root() {
            return Err(BackendError::Unsupported("cannot delete the root directory".to_string()));
        }
        let mut nodes = self.nodes.write().await;
        match nodes.get(path) {
            None => return Err(BackendError::NotFound(path.clone())),
            Some(Node::File { .. }) => {
                nodes.remove(path);
                return Ok(());
            }
            Some(Node::Directory { .. }) => {}
        }

        let doomed = subtree(&nodes, path);
        if doomed.len() > 1 && !recursive {
            return Err(BackendError::DirectoryNotEmpty(path.clone()));
        }
        for victim in doomed {
            nodes.remove(&victim);
        }
        Ok(())
    }

    async fn rename(&self, from: &NormalizedPath, to: &NormalizedPath) -> Result<(), BackendError> {
        self.count();
        if from.is_root() || to.starts_with(from) {
            return Err(BackendError::Unsupported(format!("cannot move {} into {}", from, to)));
        }
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(from) {
            return Err(BackendError::NotFound(from.clone()));
        }
        if nodes.contains_key(to) {
            return Err(BackendError::AlreadyExists(to.clone()));
        }
        require_parent_dir(&nodes, to)?;

        for old in subtree(&nodes, from) {
            let Some(node) = nodes.remove(&old) else {
                continue;
            };
            let relative = old.strip_prefix(from).unwrap_or_else(NormalizedPath::root);
            let new = to
                .join(relative.as_str())
                .map_err(|e| BackendError::Unsupported(e.to_string()))?;
            nodes.insert(new, node);
        }
        Ok(())
    }

    async fn disk_usage(&self, path: &NormalizedPath) -> Result<DiskUsage, BackendError> {
        self.count();
        let nodes = self.nodes.read().await;
        if !nodes.contains_key(path) {
            return Err(BackendError::NotFound(path.clone()));
        }
        let used = nodes
            .iter()
            .filter(|(p, _)| p.starts_with(path))
            .map(|(_, node)| match node {
                Node::File { data, .. } => data.len() as u64,
                Node::Directory { .. } => 0,
            })
            .sum();
        Ok(DiskUsage {
            used,
            total: None,
            free: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> NormalizedPath {
        NormalizedPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_with_offsets() {
        let backend = MemoryBackend::default();
        backend.write(&p("/f"), 0, b"hello world").await.unwrap();
        backend.write(&p("/f"), 6, b"there").await.unwrap();

        assert_eq!(backend.read(&p("/f"), 0, None).await.unwrap(), b"hello there");
        assert_eq!(backend.read(&p("/f"), 6, Some(3)).await.unwrap(), b"the");
        assert!(backend.read(&p("/f"), 100, None).await.unwrap().is_empty());

        backend.write(&p("/f"), 13, b"!").await.unwrap();
        assert_eq!(backend.read(&p("/f"), 11, None).await.unwrap(), b"\0\0!");
    }

    #[tokio::test]
    async fn test_create_requires_parent_and_rejects_existing() {
        let backend = MemoryBackend::default();
        assert!(matches!(
            backend.create(&p("/missing/f"), b"x").await,
            Err(BackendError::NotFound(parent)) if parent == p("/missing")
        ));

        backend.mkdir(&p("/a/b")).await.unwrap();
        backend.create(&p("/a/b/f"), b"x").await.unwrap();
        assert!(matches!(
            backend.create(&p("/a/b/f"), b"y").await,
            Err(BackendError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_list_returns_direct_children() {
        let backend = MemoryBackend::default();
        backend.mkdir(&p("/dir/sub")).await.unwrap();
        backend.create(&p("/dir/a.txt"), b"abc").await.unwrap();
        backend.create(&p("/dir/sub/deep.txt"), b"x").await.unwrap();

        let listing = backend.list(&p("/dir")).await.unwrap();
        let names: Vec<_> = listing.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(names, vec!["/dir/a.txt", "/dir/sub"]);
        assert_eq!(listing[0].size, 3);
        assert!(listing[1].is_dir());

        assert!(matches!(
            backend.list(&p("/dir/a.txt")).await,
            Err(BackendError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_non_empty_requires_recursive() {
        let backend = MemoryBackend::default();
        backend.mkdir(&p("/d")).await.unwrap();
        backend.create(&p("/d/f"), b"x").await.unwrap();

        assert!(matches!(
            backend.delete(&p("/d"), false).await,
            Err(BackendError::DirectoryNotEmpty(_))
        ));
        backend.delete(&p("/d"), true).await.unwrap();
        assert!(matches!(backend.stat(&p("/d/f")).await, Err(BackendError::NotFound(_))));
        assert!(backend.delete(&p("/"), true).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let backend = MemoryBackend::default();
        backend.mkdir(&p("/src/inner")).await.unwrap();
        backend.create(&p("/src/inner/f"), b"data").await.unwrap();

        backend.rename(&p("/src"), &p("/dst")).await.unwrap();
        assert_eq!(backend.read(&p("/dst/inner/f"), 0, None).await.unwrap(), b"data");
        assert!(backend.stat(&p("/src")).await.is_err());

        assert!(matches!(
            backend.rename(&p("/dst"), &p("/dst/inner/loop")).await,
            Err(BackendError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_disk_usage_sums_subtree() {
        let backend = MemoryBackend::default();
        backend.mkdir(&p("/a")).await.unwrap();
        backend.create(&p("/a/one"), &[0; 10]).await.unwrap();
        backend.create(&p("/b"), &[0; 5]).await.unwrap();

        assert_eq!(backend.disk_usage(&p("/a")).await.unwrap().used, 10);
        assert_eq!(backend.disk_usage(&p("/")).await.unwrap().used, 15);
        assert_eq!(backend.operation_count(), 5);
    }
}
