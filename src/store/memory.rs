//! In-memory segment store

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::{SegmentStore, SegmentWrite, StoreError, StoreResult};

/// RAM-backed store; the default backend
///
/// Files are plain byte vectors behind one lock. Reads hand out an owned
/// snapshot, so removing a folder never invalidates data a reader already
/// holds.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tree>>,
}

#[derive(Default)]
#[derive(Debug)]
struct Tree {
    dirs: HashSet<String>,
    files: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir)
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

impl SegmentStore for MemoryStore {
    fn mkdir_all(&self, path: &str) -> StoreResult<()> {
        let path = normalize(path);
        let mut tree = self.inner.write();
        let mut prefix = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            tree.dirs.insert(prefix.clone());
        }
        Ok(())
    }

    fn create(&self, path: &str) -> StoreResult<()> {
        let path = normalize(path);
        let mut tree = self.inner.write();
        if let Some(dir) = parent(&path) {
            if !tree.dirs.contains(dir) {
                return Err(StoreError::NotFound(dir.to_string()));
            }
        }
        tree.files.insert(path, Vec::new());
        Ok(())
    }

    fn open_append(&self, path: &str) -> StoreResult<Box<dyn SegmentWrite>> {
        let path = normalize(path);
        let tree = self.inner.read();
        if !tree.files.contains_key(&path) {
            return Err(StoreError::NotFound(path));
        }
        drop(tree);
        Ok(Box::new(MemWriter {
            inner: Arc::clone(&self.inner),
            path,
        }))
    }

    fn read(&self, path: &str) -> StoreResult<Bytes> {
        let path = normalize(path);
        let tree = self.inner.read();
        tree.files
            .get(&path)
            .map(|data| Bytes::copy_from_slice(data))
            .ok_or(StoreError::NotFound(path))
    }

    fn read_dir(&self, path: &str) -> StoreResult<Vec<String>> {
        let path = normalize(path);
        let tree = self.inner.read();
        if !tree.dirs.contains(&path) {
            return Err(StoreError::NotFound(path));
        }
        let mut entries: Vec<String> = tree
            .files
            .keys()
            .filter(|file| parent(file) == Some(path.as_str()))
            .map(|file| file_name(file).to_string())
            .collect();
        entries.extend(
            tree.dirs
                .iter()
                .filter(|dir| parent(dir) == Some(path.as_str()))
                .map(|dir| file_name(dir).to_string()),
        );
        Ok(entries)
    }

    fn remove_all(&self, path: &str) -> StoreResult<()> {
        let path = normalize(path);
        let mut tree = self.inner.write();
        let prefix = format!("{path}/");
        tree.files
            .retain(|file, _| file != &path && !file.starts_with(&prefix));
        tree.dirs
            .retain(|dir| dir != &path && !dir.starts_with(&prefix));
        Ok(())
    }

    fn stat(&self, path: &str) -> StoreResult<u64> {
        let path = normalize(path);
        let tree = self.inner.read();
        if let Some(data) = tree.files.get(&path) {
            return Ok(data.len() as u64);
        }
        if tree.dirs.contains(&path) {
            return Ok(0);
        }
        Err(StoreError::NotFound(path))
    }
}

#[derive(Debug)]
struct MemWriter {
    inner: Arc<RwLock<Tree>>,
    path: String,
}

impl SegmentWrite for MemWriter {
    fn append(&mut self, buf: &[u8]) -> StoreResult<()> {
        let mut tree = self.inner.write();
        match tree.files.get_mut(&self.path) {
            Some(data) => {
                data.extend_from_slice(buf);
                Ok(())
            }
            // Folder was reaped while we held the handle
            None => Err(StoreError::NotFound(self.path.clone())),
        }
    }
}
