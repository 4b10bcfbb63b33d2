//! Schema validation of stage output.
//!
//! Normalize output is checked record by record against the canonical shape;
//! parse output only has to be well-formed ndjson. Validation reports, it
//! never gates: a bad line is recorded and checking continues with the next
//! line, artifact, and site.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, instrument, warn};

use feedingest_shared::{NORMALIZED_SCHEMA_VERSION, Stage};
use feedingest_storage::ArtifactStore;

/// What is wrong with one line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingKind {
    /// The artifact could not be read at all.
    Unreadable { message: String },
    /// The line is not valid JSON.
    Malformed { message: String },
    NotAnObject,
    MissingId,
    MissingName,
    MissingLocation,
    NonNumericCoordinate { field: String },
    LatitudeOutOfRange { value: f64 },
    LongitudeOutOfRange { value: f64 },
    MissingSource,
    DuplicateId { id: String, first_seen: String },
    SchemaVersionMismatch { found: Value },
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable { message } => write!(f, "unreadable: {message}"),
            Self::Malformed { message } => write!(f, "malformed JSON: {message}"),
            Self::NotAnObject => f.write_str("record is not a JSON object"),
            Self::MissingId => f.write_str("missing or empty id"),
            Self::MissingName => f.write_str("missing name"),
            Self::MissingLocation => f.write_str("missing location"),
            Self::NonNumericCoordinate { field } => write!(f, "{field} is not a number"),
            Self::LatitudeOutOfRange { value } => write!(f, "latitude {value} outside [-90, 90]"),
            Self::LongitudeOutOfRange { value } => {
                write!(f, "longitude {value} outside [-180, 180]")
            }
            Self::MissingSource => f.write_str("missing source attribution"),
            Self::DuplicateId { id, first_seen } => {
                write!(f, "duplicate id '{id}' (first seen at {first_seen})")
            }
            Self::SchemaVersionMismatch { found } => write!(
                f,
                "schema_version {found} does not match {NORMALIZED_SCHEMA_VERSION}"
            ),
        }
    }
}

/// One problem at one line of one artifact. Line 0 means the whole artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationFinding {
    pub artifact: String,
    pub line: usize,
    #[serde(flatten)]
    pub kind: FindingKind,
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.artifact, self.line, self.kind)
    }
}

/// Validation totals for one site's stage output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub artifacts: usize,
    pub records: usize,
    pub invalid_records: usize,
    pub findings: Vec<ValidationFinding>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub(crate) fn absorb(&mut self, other: ValidationReport) {
        self.artifacts += other.artifacts;
        self.records += other.records;
        self.invalid_records += other.invalid_records;
        self.findings.extend(other.findings);
    }
}

// ---------------------------------------------------------------------------
// Record checks
// ---------------------------------------------------------------------------

/// Checks normalized records. One validator per site so duplicate ids are
/// caught across all of that site's artifacts.
#[derive(Debug, Default)]
pub struct RecordValidator {
    seen: HashMap<String, String>,
}

impl RecordValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check one record line; an empty result means the record is valid.
    pub fn check_line(&mut self, artifact: &str, line_no: usize, line: &str) -> Vec<FindingKind> {
        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                return vec![FindingKind::Malformed {
                    message: e.to_string(),
                }];
            }
        };
        let Some(record) = record.as_object() else {
            return vec![FindingKind::NotAnObject];
        };

        let mut findings = Vec::new();

        match record.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => {
                let here = format!("{artifact}:{line_no}");
                if let Some(first_seen) = self.seen.get(id) {
                    findings.push(FindingKind::DuplicateId {
                        id: id.to_string(),
                        first_seen: first_seen.clone(),
                    });
                } else {
                    self.seen.insert(id.to_string(), here);
                }
            }
            _ => findings.push(FindingKind::MissingId),
        }

        if !record.get("name").is_some_and(Value::is_string) {
            findings.push(FindingKind::MissingName);
        }

        match record.get("location").and_then(Value::as_object) {
            Some(location) => {
                check_coordinate(location.get("latitude"), "latitude", 90.0, &mut findings);
                check_coordinate(location.get("longitude"), "longitude", 180.0, &mut findings);
            }
            None => findings.push(FindingKind::MissingLocation),
        }

        let has_source = record
            .get("source")
            .and_then(Value::as_object)
            .and_then(|s| s.get("source"))
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty());
        if !has_source {
            findings.push(FindingKind::MissingSource);
        }

        if let Some(version) = record.get("schema_version") {
            if version.as_u64() != Some(u64::from(NORMALIZED_SCHEMA_VERSION)) {
                findings.push(FindingKind::SchemaVersionMismatch {
                    found: version.clone(),
                });
            }
        }

        findings
    }

    /// Stream an artifact line by line.
    pub async fn check_artifact<R>(&mut self, artifact: &str, reader: R) -> ValidationReport
    where
        R: AsyncBufRead + Unpin,
    {
        let mut report = ValidationReport {
            artifacts: 1,
            ..ValidationReport::default()
        };

        for_each_line(artifact, reader, &mut report, |line_no, line, report| {
            report.records += 1;
            let kinds = self.check_line(artifact, line_no, line);
            if !kinds.is_empty() {
                report.invalid_records += 1;
            }
            report
                .findings
                .extend(kinds.into_iter().map(|kind| ValidationFinding {
                    artifact: artifact.to_string(),
                    line: line_no,
                    kind,
                }));
        })
        .await;

        report
    }
}

fn check_coordinate(
    value: Option<&Value>,
    field: &str,
    bound: f64,
    findings: &mut Vec<FindingKind>,
) {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        findings.push(FindingKind::MissingLocation);
        return;
    };
    let Some(number) = value.as_f64() else {
        findings.push(FindingKind::NonNumericCoordinate {
            field: field.to_string(),
        });
        return;
    };
    if !(-bound..=bound).contains(&number) {
        findings.push(if field == "latitude" {
            FindingKind::LatitudeOutOfRange { value: number }
        } else {
            FindingKind::LongitudeOutOfRange { value: number }
        });
    }
}

/// Check that every non-blank line of a parse artifact is a JSON value.
pub async fn check_ndjson<R>(artifact: &str, reader: R) -> ValidationReport
where
    R: AsyncBufRead + Unpin,
{
    let mut report = ValidationReport {
        artifacts: 1,
        ..ValidationReport::default()
    };

    for_each_line(artifact, reader, &mut report, |line_no, line, report| {
        report.records += 1;
        if let Err(e) = serde_json::from_str::<serde::de::IgnoredAny>(line) {
            report.invalid_records += 1;
            report.findings.push(ValidationFinding {
                artifact: artifact.to_string(),
                line: line_no,
                kind: FindingKind::Malformed {
                    message: e.to_string(),
                },
            });
        }
    })
    .await;

    report
}

/// Feed each non-blank line (1-based numbering) to `visit`.
async fn for_each_line<R, F>(artifact: &str, reader: R, report: &mut ValidationReport, mut visit: F)
where
    R: AsyncBufRead + Unpin,
    F: FnMut(usize, &str, &mut ValidationReport),
{
    let mut lines = reader.lines();
    let mut line_no = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                line_no += 1;
                if !line.trim().is_empty() {
                    visit(line_no, &line, &mut *report);
                }
            }
            Ok(None) => break,
            Err(e) => {
                report.findings.push(ValidationFinding {
                    artifact: artifact.to_string(),
                    line: line_no + 1,
                    kind: FindingKind::Unreadable {
                        message: e.to_string(),
                    },
                });
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store-level validation
// ---------------------------------------------------------------------------

/// Validate every visible artifact in a store run directory of `stage`.
///
/// Fetch output is opaque and always validates clean.
#[instrument(skip(store))]
pub async fn validate_run_dir(store: &dyn ArtifactStore, stage: Stage, dir: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    if stage == Stage::Fetch {
        return report;
    }

    let names = match store.list(dir).await {
        Ok(names) => names,
        Err(e) => {
            report.findings.push(ValidationFinding {
                artifact: dir.to_string(),
                line: 0,
                kind: FindingKind::Unreadable {
                    message: e.to_string(),
                },
            });
            return report;
        }
    };

    let mut validator = RecordValidator::new();
    for name in names {
        let path = format!("{dir}/{name}");
        let bytes = match store.read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                report.artifacts += 1;
                report.findings.push(ValidationFinding {
                    artifact: name,
                    line: 0,
                    kind: FindingKind::Unreadable {
                        message: e.to_string(),
                    },
                });
                continue;
            }
        };

        let artifact_report = match stage {
            Stage::Normalize => validator.check_artifact(&name, bytes.as_slice()).await,
            _ => check_ndjson(&name, bytes.as_slice()).await,
        };
        report.absorb(artifact_report);
    }

    if report.is_clean() {
        debug!(records = report.records, "output valid");
    } else {
        warn!(
            records = report.records,
            invalid = report.invalid_records,
            findings = report.findings.len(),
            "output has validation findings"
        );
    }
    report
}
