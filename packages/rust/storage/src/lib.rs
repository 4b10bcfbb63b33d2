//! Artifact store: a uniform read/write/list surface over a directory tree.
//!
//! Two backends share the [`ArtifactStore`] contract:
//! - [`LocalStore`] - a directory on local disk
//! - [`GcsStore`] - a bucket (plus optional prefix) behind a GCS-style JSON API
//!
//! Paths are `/`-separated keys relative to the store root, e.g.
//! `ca/sf_gov/raw/2021-04-01T09:05:03/locations.json`. The store knows nothing
//! about stages or sites; callers never branch on which backend is active.
//!
//! **Guarantees:**
//! - a written artifact becomes visible all at once (no partial reads)
//! - [`ArtifactStore::list`] returns visible names in lexicographic order

mod gcs;
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use feedingest_shared::{IngestError, Result, StorageConfig, storage_token};

pub use gcs::GcsStore;
pub use local::LocalStore;

/// URI scheme selecting the remote backend.
const GCS_SCHEME: &str = "gs://";

/// Read/write/list access to artifacts under a root.
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    /// Human-readable root (path or URI) for logs and reports.
    fn root(&self) -> String;

    /// Check that the root is reachable and writable. Called once before a run.
    async fn probe(&self) -> Result<()>;

    /// Write `bytes` to `path`, replacing any previous artifact atomically.
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Read the artifact at `path`.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Visible child names (artifacts or sub-directories) of `dir`, sorted.
    /// A missing directory lists as empty.
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Whether an artifact exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Open the store for an output root: `gs://bucket[/prefix]`, `file://path`,
/// or a plain local path.
pub fn open_store(uri: &str, config: &StorageConfig) -> Result<Arc<dyn ArtifactStore>> {
    if let Some(rest) = uri.strip_prefix(GCS_SCHEME) {
        let store = GcsStore::new(rest, &config.endpoint, storage_token(config))?;
        return Ok(Arc::new(store));
    }

    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Arc::new(LocalStore::new(path)));
    }

    if let Some((scheme, _)) = uri.split_once("://") {
        return Err(IngestError::config(format!(
            "unsupported output scheme '{scheme}://' (expected a local path or gs://)"
        )));
    }

    Ok(Arc::new(LocalStore::new(uri)))
}

/// Reject keys that would escape the store root or address nothing.
pub(crate) fn check_key(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') {
        return Err(IngestError::storage(format!("invalid artifact path '{path}'")));
    }
    if path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(IngestError::storage(format!("invalid artifact path '{path}'")));
    }
    Ok(())
}
