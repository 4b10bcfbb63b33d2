//! Local-filesystem artifact store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use feedingest_shared::{IngestError, Result, is_visible};
use tracing::debug;
use uuid::Uuid;

use crate::{ArtifactStore, check_key};

/// Artifact store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute-or-relative filesystem path for a store key.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        check_key(path)?;
        Ok(self.resolve(path))
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> IngestError {
    IngestError::storage(format!("{}: {e}", path.display()))
}

#[async_trait]
impl ArtifactStore for LocalStore {
    fn root(&self) -> String {
        self.root.display().to_string()
    }

    async fn probe(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| unavailable(&self.root, e))?;

        // Root must accept writes, not just exist.
        let marker = self.root.join(format!(".probe-{}", Uuid::now_v7()));
        tokio::fs::write(&marker, b"")
            .await
            .map_err(|e| unavailable(&self.root, e))?;
        let _ = tokio::fs::remove_file(&marker).await;

        debug!(root = %self.root.display(), "local store reachable");
        Ok(())
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.full_path(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| IngestError::storage(format!("invalid artifact path '{path}'")))?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| unavailable(parent, e))?;

        // Write to temp file first, then rename into place
        let temp = parent.join(format!(".{file_name}.{}.tmp", Uuid::now_v7()));
        if let Err(e) = tokio::fs::write(&temp, bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(unavailable(&temp, e));
        }
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| unavailable(&target, e))?;

        debug!(path, size = bytes.len(), "wrote artifact");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(IngestError::ArtifactNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(unavailable(&full, e)),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let full = if dir.is_empty() {
            self.root.clone()
        } else {
            self.full_path(dir)?
        };

        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(&full, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(&full, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_visible(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.full_path(path)?;
        tokio::fs::try_exists(&full)
            .await
            .map_err(|e| unavailable(&full, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("fi-local-store-test-{}", Uuid::now_v7()))
    }

    #[tokio::test]
    async fn write_then_read() {
        let root = temp_root();
        let store = LocalStore::new(&root);
        store.probe().await.unwrap();

        store
            .write("ca/sf_gov/raw/run1/data.json", b"{\"a\":1}")
            .await
            .unwrap();

        let bytes = store.read("ca/sf_gov/raw/run1/data.json").await.unwrap();
        assert_eq!(bytes, b"{\"a\":1}");
        assert!(store.exists("ca/sf_gov/raw/run1/data.json").await.unwrap());
        assert!(!store.exists("ca/sf_gov/raw/run1/other.json").await.unwrap());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let root = temp_root();
        let store = LocalStore::new(&root);

        store.write("a/b.txt", b"first").await.unwrap();
        store.write("a/b.txt", b"second").await.unwrap();
        assert_eq!(store.read("a/b.txt").await.unwrap(), b"second");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn list_is_sorted_and_hides_private_names() {
        let root = temp_root();
        let store = LocalStore::new(&root);

        for name in ["zeta.ndjson", "alpha.ndjson", "_meta.json", ".hidden"] {
            store.write(&format!("dir/{name}"), b"x").await.unwrap();
        }

        let names = store.list("dir").await.unwrap();
        assert_eq!(names, vec!["alpha.ndjson", "zeta.ndjson"]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let root = temp_root();
        let store = LocalStore::new(&root);
        store.write("dir/out.json", b"{}").await.unwrap();

        for entry in std::fs::read_dir(root.join("dir")).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.ends_with(".tmp"), "temp file left behind: {name}");
        }

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_dir_lists_empty_and_missing_file_is_not_found() {
        let store = LocalStore::new(temp_root());
        assert!(store.list("nowhere").await.unwrap().is_empty());

        let err = store.read("nowhere/x.json").await.unwrap_err();
        assert!(matches!(err, IngestError::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let store = LocalStore::new(temp_root());
        let err = store.write("../escape.txt", b"x").await.unwrap_err();
        assert!(err.is_storage());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_fails_on_unwritable_root() {
        // A regular file cannot serve as a store root.
        let file = std::env::temp_dir().join(format!("fi-not-a-dir-{}", Uuid::now_v7()));
        std::fs::write(&file, b"x").unwrap();

        let store = LocalStore::new(file.join("sub"));
        let err = store.probe().await.unwrap_err();
        assert!(err.is_storage());

        let _ = std::fs::remove_file(&file);
    }
}
