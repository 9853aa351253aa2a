//! Disk-backed segment store

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;

use super::{SegmentStore, SegmentWrite, StoreError, StoreResult};

/// Store rooted at a throwaway directory
///
/// Segment appends are small (one read chunk at a time) and sequential, so
/// plain blocking file IO is used; the root is wiped on [`DiskStore::new`]
/// so a crashed predecessor leaves nothing behind.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Create a store under `root`, clearing any previous contents
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let _ = fs::remove_dir_all(&root);
        let _ = fs::create_dir_all(&root);
        Self { root }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_matches('/'))
    }
}

fn map_err(path: &str, err: std::io::Error) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(path.to_string())
    } else {
        StoreError::Io(err)
    }
}

impl SegmentStore for DiskStore {
    fn mkdir_all(&self, path: &str) -> StoreResult<()> {
        fs::create_dir_all(self.resolve(path)).map_err(|e| map_err(path, e))
    }

    fn create(&self, path: &str) -> StoreResult<()> {
        fs::File::create(self.resolve(path)).map_err(|e| map_err(path, e))?;
        Ok(())
    }

    fn open_append(&self, path: &str) -> StoreResult<Box<dyn SegmentWrite>> {
        let file = fs::OpenOptions::new()
            .append(true)
            .open(self.resolve(path))
            .map_err(|e| map_err(path, e))?;
        Ok(Box::new(DiskWriter {
            file,
            path: path.to_string(),
        }))
    }

    fn read(&self, path: &str) -> StoreResult<Bytes> {
        let data = fs::read(self.resolve(path)).map_err(|e| map_err(path, e))?;
        Ok(Bytes::from(data))
    }

    fn read_dir(&self, path: &str) -> StoreResult<Vec<String>> {
        let entries = fs::read_dir(self.resolve(path)).map_err(|e| map_err(path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| map_err(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn remove_all(&self, path: &str) -> StoreResult<()> {
        let target = self.resolve(path);
        let result = if target.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn stat(&self, path: &str) -> StoreResult<u64> {
        let meta = fs::metadata(self.resolve(path)).map_err(|e| map_err(path, e))?;
        if meta.is_dir() {
            Ok(0)
        } else {
            Ok(meta.len())
        }
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[derive(Debug)]
struct DiskWriter {
    file: fs::File,
    path: String,
}

impl SegmentWrite for DiskWriter {
    fn append(&mut self, buf: &[u8]) -> StoreResult<()> {
        self.file.write_all(buf).map_err(|e| map_err(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> DiskStore {
        let dir = tempfile::tempdir().unwrap();
        // Keep the tempdir alive by leaking it into the root path; the store
        // removes the tree itself on drop.
        DiskStore::new(dir.keep())
    }

    #[test]
    fn test_round_trip() {
        let store = temp_store();
        store.mkdir_all("H2/def").unwrap();
        store.create("H2/def/1.ts").unwrap();

        let mut writer = store.open_append("H2/def/1.ts").unwrap();
        writer.append(b"abc").unwrap();
        drop(writer);

        assert_eq!(store.read("H2/def/1.ts").unwrap().as_ref(), b"abc");
        assert_eq!(store.stat("H2/def/1.ts").unwrap(), 3);
        assert_eq!(store.read_dir("H2/def").unwrap(), vec!["1.ts"]);
    }

    #[test]
    fn test_missing_paths_are_not_found() {
        let store = temp_store();

        assert!(store.read("nope/1.ts").unwrap_err().is_not_found());
        assert!(store.stat("nope").unwrap_err().is_not_found());
        assert!(store.open_append("nope/1.ts").unwrap_err().is_not_found());
        store.remove_all("nope").unwrap();
    }

    #[test]
    fn test_remove_all_clears_folder() {
        let store = temp_store();
        store.mkdir_all("M1/x").unwrap();
        store.create("M1/x/1.ts").unwrap();
        store.create("M1/x/2.ts").unwrap();

        store.remove_all("M1/x").unwrap();

        assert!(store.stat("M1/x").unwrap_err().is_not_found());
    }
}
