//! Run report: per-site outcomes, overall classification, exit code.

use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use serde::Serialize;

use feedingest_shared::{RunTimestamp, SiteId, Stage};

use crate::executor::StageStatus;
use crate::staging::StageRunResult;
use crate::validate::ValidationReport;

/// Which stages an invocation asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "request", content = "stage", rename_all = "snake_case")]
pub enum StageRequest {
    /// Run exactly one stage.
    Single(Stage),
    /// Run fetch, parse, and normalize in order.
    All,
}

impl StageRequest {
    /// Stages to run, in order.
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            Self::Single(stage) => vec![*stage],
            Self::All => Stage::ALL.to_vec(),
        }
    }
}

impl fmt::Display for StageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(stage) => write!(f, "{stage}"),
            Self::All => f.write_str("all-stages"),
        }
    }
}

/// Terminal state of one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SiteOutcome {
    /// Every requested stage succeeded.
    Complete { through: Stage },
    /// A stage failed; later stages were not attempted.
    FailedAt { stage: Stage, reason: StageStatus },
    /// The runner does not implement `missing`; later stages were not attempted.
    Incomplete { missing: Stage },
    /// No runner exists for the requested site.
    NotFound,
    /// The run was cancelled; `stage` is the stage that was interrupted, if any.
    Cancelled { stage: Option<Stage> },
}

impl SiteOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

impl fmt::Display for SiteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete { through } => write!(f, "complete ({through} done)"),
            Self::FailedAt { stage, reason } => write!(f, "failed at {stage}: {reason}"),
            Self::Incomplete { missing } => write!(f, "incomplete (no {missing})"),
            Self::NotFound => f.write_str("not found"),
            Self::Cancelled { stage: Some(stage) } => write!(f, "cancelled during {stage}"),
            Self::Cancelled { stage: None } => f.write_str("cancelled"),
        }
    }
}

/// Everything recorded for one site.
#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    pub site: SiteId,
    pub outcome: SiteOutcome,
    pub stages: Vec<StageRunResult>,
    /// Findings for parse and normalize output written in this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

impl SiteReport {
    pub fn new(site: SiteId, outcome: SiteOutcome) -> Self {
        Self {
            site,
            outcome,
            stages: Vec::new(),
            validation: None,
        }
    }

    /// Number of validation findings.
    pub fn finding_count(&self) -> usize {
        self.validation.as_ref().map_or(0, |v| v.findings.len())
    }

    /// Number of stage warnings.
    pub fn warning_count(&self) -> usize {
        self.stages.iter().map(|s| s.warnings.len()).sum()
    }
}

/// Overall classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every requested site completed (vacuously true for no sites).
    AllSucceeded,
    Partial,
    TotalFailure,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AllSucceeded => 0,
            Self::Partial => 1,
            Self::TotalFailure => 2,
            Self::Cancelled => 130,
        }
    }
}

/// Counts of sites per terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub complete: usize,
    pub failed: usize,
    pub incomplete: usize,
    pub not_found: usize,
    pub cancelled: usize,
}

/// Aggregate outcome of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: RunTimestamp,
    pub store_root: String,
    #[serde(flatten)]
    pub request: StageRequest,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub counts: OutcomeCounts,
    pub sites: Vec<SiteReport>,
}

impl RunReport {
    /// Build the report from collected site reports.
    pub fn new(
        run: RunTimestamp,
        store_root: String,
        request: StageRequest,
        started_at: DateTime<Utc>,
        mut sites: Vec<SiteReport>,
    ) -> Self {
        sites.sort_by(|a, b| a.site.cmp(&b.site));
        let counts = count_outcomes(&sites);
        let status = classify(&counts, sites.len());
        Self {
            run,
            store_root,
            request,
            started_at,
            finished_at: Utc::now(),
            status,
            counts,
            sites,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn site(&self, site: &SiteId) -> Option<&SiteReport> {
        self.sites.iter().find(|s| &s.site == site)
    }

    /// Human-readable per-site table followed by totals.
    pub fn render_summary(&self) -> String {
        let width = self
            .sites
            .iter()
            .map(|s| s.site.to_string().len())
            .max()
            .unwrap_or(4)
            .max(4);

        let mut out = String::new();
        let _ = writeln!(out, "{:<width$}  {:<12}  {}", "SITE", "DURATION", "OUTCOME");
        for site in &self.sites {
            let duration: std::time::Duration = site.stages.iter().map(|s| s.duration).sum();
            let mut line = format!(
                "{:<width$}  {:<12}  {}",
                site.site.to_string(),
                format!("{:.1}s", duration.as_secs_f64()),
                site.outcome
            );
            let findings = site.finding_count();
            if findings > 0 {
                let _ = write!(line, " [{findings} validation findings]");
            }
            let warnings = site.warning_count();
            if warnings > 0 {
                let _ = write!(line, " [{warnings} warnings]");
            }
            let _ = writeln!(out, "{line}");
        }

        let c = &self.counts;
        let _ = writeln!(
            out,
            "\n{} sites: {} complete, {} failed, {} incomplete, {} not found, {} cancelled",
            self.sites.len(),
            c.complete,
            c.failed,
            c.incomplete,
            c.not_found,
            c.cancelled
        );
        let _ = writeln!(
            out,
            "run {} ({}) -> {}",
            self.run, self.request, self.store_root
        );
        out
    }
}

fn count_outcomes(sites: &[SiteReport]) -> OutcomeCounts {
    let mut counts = OutcomeCounts::default();
    for site in sites {
        match site.outcome {
            SiteOutcome::Complete { .. } => counts.complete += 1,
            SiteOutcome::FailedAt { .. } => counts.failed += 1,
            SiteOutcome::Incomplete { .. } => counts.incomplete += 1,
            SiteOutcome::NotFound => counts.not_found += 1,
            SiteOutcome::Cancelled { .. } => counts.cancelled += 1,
        }
    }
    counts
}

fn classify(counts: &OutcomeCounts, total: usize) -> RunStatus {
    if counts.cancelled > 0 {
        RunStatus::Cancelled
    } else if counts.complete == total {
        RunStatus::AllSucceeded
    } else if counts.complete == 0 {
        RunStatus::TotalFailure
    } else {
        RunStatus::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcomes: Vec<(&str, SiteOutcome)>) -> RunReport {
        let sites = outcomes
            .into_iter()
            .map(|(site, outcome)| SiteReport::new(site.parse().unwrap(), outcome))
            .collect();
        RunReport::new(
            RunTimestamp::now(),
            "out".into(),
            StageRequest::All,
            Utc::now(),
            sites,
        )
    }

    fn done() -> SiteOutcome {
        SiteOutcome::Complete {
            through: Stage::Normalize,
        }
    }

    fn failed() -> SiteOutcome {
        SiteOutcome::FailedAt {
            stage: Stage::Fetch,
            reason: StageStatus::NonZeroExit { code: 2 },
        }
    }

    #[test]
    fn classification_and_exit_codes() {
        let all = report(vec![("ca/a", done()), ("ca/b", done())]);
        assert_eq!(all.status, RunStatus::AllSucceeded);
        assert_eq!(all.exit_code(), 0);

        let partial = report(vec![("ca/a", done()), ("ca/b", failed())]);
        assert_eq!(partial.status, RunStatus::Partial);
        assert_eq!(partial.exit_code(), 1);

        let none = report(vec![("ca/a", failed()), ("ca/b", SiteOutcome::NotFound)]);
        assert_eq!(none.status, RunStatus::TotalFailure);
        assert_eq!(none.exit_code(), 2);

        let cancelled = report(vec![
            ("ca/a", done()),
            ("ca/b", SiteOutcome::Cancelled { stage: None }),
        ]);
        assert_eq!(cancelled.exit_code(), 130);
    }

    #[test]
    fn empty_selection_is_vacuous_success() {
        let empty = report(vec![]);
        assert_eq!(empty.status, RunStatus::AllSucceeded);
        assert_eq!(empty.exit_code(), 0);
    }

    #[test]
    fn incomplete_is_not_success() {
        let r = report(vec![(
            "ri/arcgis",
            SiteOutcome::Incomplete {
                missing: Stage::Parse,
            },
        )]);
        assert_eq!(r.counts.incomplete, 1);
        assert_ne!(r.exit_code(), 0);
    }

    #[test]
    fn summary_lists_sites_in_order_with_counts() {
        let r = report(vec![
            ("ca/zeta", failed()),
            ("ca/alpha", done()),
            ("tx/gone", SiteOutcome::NotFound),
        ]);
        let summary = r.render_summary();
        let alpha = summary.find("ca/alpha").unwrap();
        let zeta = summary.find("ca/zeta").unwrap();
        assert!(alpha < zeta);
        assert!(summary.contains("failed at fetch: exit 2"));
        assert!(summary.contains("3 sites: 1 complete, 1 failed, 0 incomplete, 1 not found"));
    }

    #[test]
    fn report_serializes_with_tags() {
        let r = report(vec![("ca/a", failed())]);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["request"], "all");
        assert_eq!(json["status"], "total_failure");
        assert_eq!(json["sites"][0]["site"], "ca/a");
        assert_eq!(json["sites"][0]["outcome"]["state"], "failed_at");
        assert_eq!(json["sites"][0]["outcome"]["reason"]["status"], "non_zero_exit");
    }
}
