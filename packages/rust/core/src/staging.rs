//! One stage execution end to end: stage inputs locally, run the process,
//! persist the visible outputs to the artifact store.
//!
//! Stage processes only ever see private local directories. Outputs reach
//! the store only after the process succeeded, so a failing stage can never
//! touch artifacts written by an earlier stage or run. A run directory counts
//! as finished once its [`COMPLETE_MARKER`] is written after the last artifact.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use feedingest_discovery::StageCommand;
use feedingest_shared::{RunTimestamp, SiteId, Stage, is_visible};
use feedingest_storage::ArtifactStore;

use crate::cancel::CancelSignal;
use crate::executor::{ExecOutcome, StageExecutor, StageInvocation, StageStatus};

/// Written last into a run directory whose artifacts all reached the store.
/// Holds the artifact list as JSON; invisible to listings.
pub const COMPLETE_MARKER: &str = "_complete";

/// A persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactMeta {
    pub name: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Record of one stage execution for one site. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct StageRunResult {
    pub site: SiteId,
    pub stage: Stage,
    #[serde(flatten)]
    pub status: StageStatus,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// Store directory the artifacts were written to.
    pub output_dir: String,
    pub artifacts: Vec<ArtifactMeta>,
    /// Non-fatal observations (empty output, unexpected names).
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl StageRunResult {
    /// A result for a stage that never reached its process.
    pub fn not_started(site: &SiteId, stage: Stage, output_dir: String, status: StageStatus) -> Self {
        Self::from_outcome(site, stage, output_dir, ExecOutcome::bare(status, Duration::ZERO))
    }

    fn from_outcome(site: &SiteId, stage: Stage, output_dir: String, outcome: ExecOutcome) -> Self {
        Self {
            site: site.clone(),
            stage,
            status: outcome.status,
            duration: outcome.duration,
            output_dir,
            artifacts: Vec::new(),
            warnings: Vec::new(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status.is_success()
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Shared, per-run inputs to every stage execution.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub store: &'a dyn ArtifactStore,
    pub executor: &'a dyn StageExecutor,
    pub run: &'a RunTimestamp,
    pub timeout: Duration,
    pub cancel: &'a CancelSignal,
}

/// Run `stage` for `site`, reading inputs from the store directory `input`.
#[instrument(skip_all, fields(site = %site, stage = %stage))]
pub async fn run_stage(
    ctx: &StageContext<'_>,
    site: &SiteId,
    stage: Stage,
    command: &StageCommand,
    input: Option<&str>,
) -> StageRunResult {
    let output_dir = site.run_dir(stage, ctx.run);

    if ctx.cancel.is_cancelled() {
        return StageRunResult::not_started(site, stage, output_dir, StageStatus::Cancelled);
    }

    match run_dir_in_use(ctx.store, &output_dir).await {
        Ok(false) => {}
        Ok(true) => {
            warn!(dir = %output_dir, "run directory already holds artifacts");
            return StageRunResult::not_started(site, stage, output_dir, StageStatus::RunDirInUse);
        }
        Err(e) => {
            return StageRunResult::not_started(
                site,
                stage,
                output_dir,
                StageStatus::StorageUnavailable {
                    message: e.to_string(),
                },
            );
        }
    }

    let staging = match tempfile::Builder::new().prefix("feedingest-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            return StageRunResult::not_started(
                site,
                stage,
                output_dir,
                StageStatus::Staging {
                    message: e.to_string(),
                },
            );
        }
    };
    let local_out = staging.path().join("output");
    let local_in = staging.path().join("input");

    if let Err(status) = prepare_dirs(&local_out, input.map(|_| local_in.as_path())).await {
        return StageRunResult::not_started(site, stage, output_dir, status);
    }

    let started = Instant::now();
    if let Some(input) = input {
        if let Err(status) = download_inputs(ctx.store, input, &local_in).await {
            let mut result = StageRunResult::not_started(site, stage, output_dir, status);
            result.duration = started.elapsed();
            return result;
        }
    }

    let invocation = StageInvocation {
        site,
        stage,
        command,
        output_dir: &local_out,
        input_dir: input.map(|_| local_in.as_path()),
        timeout: ctx.timeout,
    };
    let outcome = ctx.executor.execute(&invocation, ctx.cancel).await;
    let mut result = StageRunResult::from_outcome(site, stage, output_dir, outcome);

    if result.succeeded() {
        let persisted = match upload_outputs(ctx.store, &local_out, &result.output_dir).await {
            Ok(artifacts) => seal_run_dir(ctx.store, &result.output_dir, &artifacts)
                .await
                .map(|()| artifacts),
            Err(status) => Err(status),
        };
        match persisted {
            Ok(artifacts) => result.artifacts = artifacts,
            Err(status) => result.status = status,
        }
    }
    result.duration = started.elapsed();

    if result.succeeded() {
        result.warnings = output_warnings(stage, &result.artifacts);
        for warning in &result.warnings {
            warn!(%site, %stage, "{warning}");
        }
        info!(
            artifacts = result.artifacts.len(),
            duration_ms = result.duration.as_millis() as u64,
            "stage succeeded"
        );
    } else {
        warn!(status = %result.status, "stage failed");
    }

    result
}

async fn prepare_dirs(output: &Path, input: Option<&Path>) -> std::result::Result<(), StageStatus> {
    for dir in std::iter::once(output).chain(input) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StageStatus::Staging {
                message: format!("{}: {e}", dir.display()),
            })?;
    }
    Ok(())
}

/// Copy the visible artifacts of a store directory into `local`.
async fn download_inputs(
    store: &dyn ArtifactStore,
    dir: &str,
    local: &Path,
) -> std::result::Result<(), StageStatus> {
    let storage = |e: feedingest_shared::IngestError| StageStatus::StorageUnavailable {
        message: e.to_string(),
    };

    let names = store.list(dir).await.map_err(storage)?;
    for name in &names {
        let bytes = store.read(&format!("{dir}/{name}")).await.map_err(storage)?;
        let target = local.join(name);
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| StageStatus::Staging {
                message: format!("{}: {e}", target.display()),
            })?;
    }
    debug!(dir, count = names.len(), "staged inputs");
    Ok(())
}

/// Write every visible file in `local` to the store directory `dir`.
async fn upload_outputs(
    store: &dyn ArtifactStore,
    local: &Path,
    dir: &str,
) -> std::result::Result<Vec<ArtifactMeta>, StageStatus> {
    let staging = |e: std::io::Error| StageStatus::Staging {
        message: format!("{}: {e}", local.display()),
    };

    let mut entries = tokio::fs::read_dir(local).await.map_err(staging)?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(staging)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_visible(&name) {
            continue;
        }
        if entry.file_type().await.map_err(staging)?.is_file() {
            names.push(name);
        } else {
            debug!(name, "ignoring non-file output entry");
        }
    }
    names.sort();

    let mut artifacts = Vec::with_capacity(names.len());
    for name in names {
        let bytes = tokio::fs::read(local.join(&name)).await.map_err(staging)?;
        store
            .write(&format!("{dir}/{name}"), &bytes)
            .await
            .map_err(|e| StageStatus::StorageUnavailable {
                message: e.to_string(),
            })?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        artifacts.push(ArtifactMeta {
            name,
            size_bytes: bytes.len() as u64,
            sha256: format!("{:x}", hasher.finalize()),
        });
    }
    Ok(artifacts)
}

/// Whether another invocation already wrote into `dir`.
async fn run_dir_in_use(store: &dyn ArtifactStore, dir: &str) -> feedingest_shared::Result<bool> {
    if !store.list(dir).await?.is_empty() {
        return Ok(true);
    }
    store.exists(&format!("{dir}/{COMPLETE_MARKER}")).await
}

/// Mark `dir` finished. Until this succeeds the run is never picked as input.
async fn seal_run_dir(
    store: &dyn ArtifactStore,
    dir: &str,
    artifacts: &[ArtifactMeta],
) -> std::result::Result<(), StageStatus> {
    let body = serde_json::to_vec(artifacts).map_err(|e| StageStatus::Staging {
        message: e.to_string(),
    })?;
    store
        .write(&format!("{dir}/{COMPLETE_MARKER}"), &body)
        .await
        .map_err(|e| StageStatus::StorageUnavailable {
            message: e.to_string(),
        })
}

fn output_warnings(stage: Stage, artifacts: &[ArtifactMeta]) -> Vec<String> {
    if artifacts.is_empty() {
        return vec![format!("{stage} produced no output")];
    }
    let Some(suffix) = stage.output_suffix() else {
        return Vec::new();
    };
    artifacts
        .iter()
        .filter(|a| !a.name.ends_with(suffix))
        .map(|a| format!("{} does not end with {suffix}", a.name))
        .collect()
}
