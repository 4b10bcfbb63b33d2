//! Pipeline coordinator: fetch → parse → normalize for many sites at once.
//!
//! Each selected site runs as one task in a bounded worker pool. Within a
//! site, stages run strictly in order and a failure ends that site's run;
//! across sites nothing is shared except the artifact store (each site writes
//! only its own subtree) and the report collector.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use feedingest_discovery::{Catalog, Runner, Selection, Selector};
use feedingest_shared::{Result, RunConfig, RunTimestamp, SiteId, Stage};
use feedingest_storage::ArtifactStore;

use crate::cancel::CancelSignal;
use crate::executor::{StageExecutor, StageStatus};
use crate::report::{RunReport, SiteOutcome, SiteReport, StageRequest};
use crate::staging::{COMPLETE_MARKER, StageContext, StageRunResult, run_stage};
use crate::validate::{ValidationReport, validate_run_dir};

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called once the selection is resolved.
    fn run_started(&self, run: &RunTimestamp, sites: usize);
    /// Called when a stage process is about to start.
    fn stage_started(&self, site: &SiteId, stage: Stage);
    /// Called when a site reaches its terminal state.
    fn site_finished(&self, report: &SiteReport);
    /// Called when the pipeline completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn run_started(&self, _run: &RunTimestamp, _sites: usize) {}
    fn stage_started(&self, _site: &SiteId, _stage: Stage) {}
    fn site_finished(&self, _report: &SiteReport) {}
    fn done(&self, _report: &RunReport) {}
}

/// Latest finished run directory of `stage` for `site`.
///
/// Runs without a [`COMPLETE_MARKER`] (interrupted uploads, concurrent
/// writers) are skipped.
pub async fn latest_run_dir(
    store: &dyn ArtifactStore,
    site: &SiteId,
    stage: Stage,
) -> Result<Option<String>> {
    let stage_dir = site.stage_dir(stage);
    let runs = store.list(&stage_dir).await?;
    for run in runs.iter().rev() {
        let dir = format!("{stage_dir}/{run}");
        if store.exists(&format!("{dir}/{COMPLETE_MARKER}")).await? {
            return Ok(Some(dir));
        }
        debug!(dir, "skipping unfinished run");
    }
    Ok(None)
}

/// Runs the stage pipeline over a selection of sites.
pub struct Pipeline {
    store: Arc<dyn ArtifactStore>,
    executor: Arc<dyn StageExecutor>,
    concurrency: usize,
    stage_timeout: Duration,
    cancel: CancelSignal,
}

/// Per-run state shared by every site task.
struct SiteTaskContext {
    store: Arc<dyn ArtifactStore>,
    executor: Arc<dyn StageExecutor>,
    run: RunTimestamp,
    stage_timeout: Duration,
    cancel: CancelSignal,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        executor: Arc<dyn StageExecutor>,
        config: &RunConfig,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            store,
            executor,
            concurrency: config.concurrency.max(1),
            stage_timeout: config.stage_timeout,
            cancel,
        }
    }

    /// Run `request` for every site `selector` picks out of `catalog`.
    ///
    /// Only an unusable store is an error; everything that goes wrong for a
    /// single site is recorded in that site's report.
    #[instrument(skip_all, fields(request = %request, store = %self.store.root()))]
    pub async fn run(
        &self,
        catalog: &Catalog,
        selector: &Selector,
        request: StageRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let run = RunTimestamp::now();

        // --- Phase 1: Store ---
        self.store.probe().await?;

        // --- Phase 2: Selection ---
        let selection = catalog.select(selector);
        if selection.is_empty() {
            warn!(?selector, "selector matched no sites");
        }
        info!(%run, sites = selection.len(), concurrency = self.concurrency, "starting run");
        progress.run_started(&run, selection.len());

        // --- Phase 3: Fan out ---
        let ctx = Arc::new(SiteTaskContext {
            store: self.store.clone(),
            executor: self.executor.clone(),
            run: run.clone(),
            stage_timeout: self.stage_timeout,
            cancel: self.cancel.clone(),
            progress: progress.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<SiteReport> = JoinSet::new();
        // Site and current stage of every spawned task, for tasks that panic.
        let mut in_flight: HashMap<Id, (SiteId, Arc<Mutex<Stage>>)> = HashMap::new();
        let first_stage = request.stages().first().copied().unwrap_or(Stage::Fetch);
        let mut reports = Vec::with_capacity(selection.len());

        for entry in selection {
            debug!(site = %entry.site(), "scheduling site");
            let runner = match entry {
                Selection::NotFound(site) => {
                    let report = SiteReport::new(site, SiteOutcome::NotFound);
                    progress.site_finished(&report);
                    reports.push(report);
                    continue;
                }
                Selection::Found(runner) => runner.clone(),
            };

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.ok(),
                _ = self.cancel.cancelled() => None,
            };
            let Some(permit) = permit else {
                let report = SiteReport::new(runner.site, SiteOutcome::Cancelled { stage: None });
                progress.site_finished(&report);
                reports.push(report);
                continue;
            };

            let ctx = ctx.clone();
            let site = runner.site.clone();
            let current = Arc::new(Mutex::new(first_stage));
            let handle = tasks.spawn({
                let current = current.clone();
                async move {
                    let _permit = permit;
                    drive_site(&ctx, &runner, request, &current).await
                }
            });
            in_flight.insert(handle.id(), (site, current));
        }

        // --- Phase 4: Collect ---
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, report)) => {
                    in_flight.remove(&id);
                    reports.push(report);
                }
                Err(e) => {
                    let Some((site, current)) = in_flight.remove(&e.id()) else {
                        error!(error = %e, "untracked site task failed");
                        continue;
                    };
                    let stage = *current.lock().unwrap_or_else(|p| p.into_inner());
                    error!(%site, %stage, error = %e, "site task panicked");
                    let reason = StageStatus::Panicked {
                        message: task_failure(e),
                    };
                    let mut report = SiteReport::new(
                        site.clone(),
                        SiteOutcome::FailedAt {
                            stage,
                            reason: reason.clone(),
                        },
                    );
                    report.stages.push(StageRunResult::not_started(
                        &site,
                        stage,
                        site.run_dir(stage, &run),
                        reason,
                    ));
                    progress.site_finished(&report);
                    reports.push(report);
                }
            }
        }

        let report = RunReport::new(run, self.store.root(), request, started_at, reports);
        progress.done(&report);

        info!(
            status = ?report.status,
            complete = report.counts.complete,
            failed = report.counts.failed,
            incomplete = report.counts.incomplete,
            not_found = report.counts.not_found,
            cancelled = report.counts.cancelled,
            "run finished"
        );

        Ok(report)
    }
}

/// Panic payload (or abort reason) of a failed site task.
fn task_failure(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Drive one site through the requested stages.
///
/// `current` tracks the stage in progress so a panic can be attributed.
#[instrument(skip_all, fields(site = %runner.site))]
async fn drive_site(
    ctx: &SiteTaskContext,
    runner: &Runner,
    request: StageRequest,
    current: &Mutex<Stage>,
) -> SiteReport {
    let site = &runner.site;
    let stage_ctx = StageContext {
        store: ctx.store.as_ref(),
        executor: ctx.executor.as_ref(),
        run: &ctx.run,
        timeout: ctx.stage_timeout,
        cancel: &ctx.cancel,
    };

    let mut stages: Vec<StageRunResult> = Vec::new();
    let mut validation: Option<ValidationReport> = None;
    let mut previous_output: Option<String> = None;
    let mut through = Stage::Fetch;

    let outcome = 'stages: {
        for stage in request.stages() {
            *current.lock().unwrap_or_else(|p| p.into_inner()) = stage;
            let Some(command) = runner.command(stage) else {
                debug!(%stage, "stage not implemented");
                break 'stages SiteOutcome::Incomplete { missing: stage };
            };

            if ctx.cancel.is_cancelled() {
                break 'stages SiteOutcome::Cancelled { stage: None };
            }

            let input = match stage.previous() {
                None => None,
                Some(prev) => match previous_output.take() {
                    Some(dir) => Some(dir),
                    None => match latest_run_dir(ctx.store.as_ref(), site, prev).await {
                        Ok(Some(dir)) => Some(dir),
                        Ok(None) => {
                            let reason = StageStatus::MissingInput { stage: prev };
                            warn!(%stage, "{reason}");
                            stages.push(StageRunResult::not_started(
                                site,
                                stage,
                                site.run_dir(stage, &ctx.run),
                                reason.clone(),
                            ));
                            break 'stages SiteOutcome::FailedAt { stage, reason };
                        }
                        Err(e) => {
                            let reason = StageStatus::StorageUnavailable {
                                message: e.to_string(),
                            };
                            stages.push(StageRunResult::not_started(
                                site,
                                stage,
                                site.run_dir(stage, &ctx.run),
                                reason.clone(),
                            ));
                            break 'stages SiteOutcome::FailedAt { stage, reason };
                        }
                    },
                },
            };

            ctx.progress.stage_started(site, stage);
            let result = run_stage(&stage_ctx, site, stage, command, input.as_deref()).await;
            let status = result.status.clone();
            let output_dir = result.output_dir.clone();
            stages.push(result);

            match status {
                StageStatus::Succeeded => {}
                StageStatus::Cancelled => break 'stages SiteOutcome::Cancelled { stage: Some(stage) },
                reason => break 'stages SiteOutcome::FailedAt { stage, reason },
            }

            if stage != Stage::Fetch {
                let found = validate_run_dir(ctx.store.as_ref(), stage, &output_dir).await;
                validation.get_or_insert_with(ValidationReport::default).absorb(found);
            }

            previous_output = Some(output_dir);
            through = stage;
        }
        SiteOutcome::Complete { through }
    };

    let report = SiteReport {
        site: site.clone(),
        outcome,
        stages,
        validation,
    };
    info!(outcome = %report.outcome, "site finished");
    ctx.progress.site_finished(&report);
    report
}
