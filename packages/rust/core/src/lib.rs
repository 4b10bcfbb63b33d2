//! Pipeline orchestration for feedingest.
//!
//! This crate ties the runner catalog and the artifact store together into
//! end-to-end runs:
//! - [`executor`] - runs one stage implementation as a child process
//! - [`staging`] - stages inputs, persists outputs, builds [`StageRunResult`]s
//! - [`pipeline`] - drives many sites through fetch → parse → normalize
//! - [`validate`] - checks parse and normalize output
//! - [`report`] - aggregates outcomes into a [`RunReport`] and exit code
//! - [`publish`] - loads normalized records into the record service

pub mod cancel;
pub mod executor;
pub mod pipeline;
pub mod publish;
pub mod report;
pub mod staging;
pub mod validate;

pub use cancel::CancelSignal;
pub use executor::{ExecOutcome, ProcessExecutor, StageExecutor, StageInvocation, StageStatus};
pub use pipeline::{Pipeline, ProgressReporter, SilentProgress, latest_run_dir};
pub use publish::{PublishSummary, Publisher, publish_sites};
pub use report::{RunReport, RunStatus, SiteOutcome, SiteReport, StageRequest};
pub use staging::{ArtifactMeta, COMPLETE_MARKER, StageRunResult};
pub use validate::{ValidationFinding, ValidationReport, validate_run_dir};

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use feedingest_shared::{IngestError, Result};
    use feedingest_storage::{ArtifactStore, LocalStore};

    /// Write an executable `/bin/sh` script and return its path.
    #[cfg(unix)]
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\nset -e\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Local store whose writes fail for every path containing `failing`.
    #[derive(Debug)]
    pub struct FailingStore {
        inner: LocalStore,
        failing: String,
    }

    impl FailingStore {
        pub fn new(root: impl Into<PathBuf>, failing: &str) -> Self {
            Self {
                inner: LocalStore::new(root),
                failing: failing.to_string(),
            }
        }
    }

    #[async_trait]
    impl ArtifactStore for FailingStore {
        fn root(&self) -> String {
            self.inner.root()
        }

        async fn probe(&self) -> Result<()> {
            self.inner.probe().await
        }

        async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
            if path.contains(&self.failing) {
                return Err(IngestError::storage(format!("permission denied: {path}")));
            }
            self.inner.write(path, bytes).await
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            self.inner.read(path).await
        }

        async fn list(&self, dir: &str) -> Result<Vec<String>> {
            self.inner.list(dir).await
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
    }
}
