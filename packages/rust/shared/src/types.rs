//! Core domain types shared by every feedingest crate.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Schema version every normalized record must conform to.
pub const NORMALIZED_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One step of the ingest pipeline. Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Parse,
    Normalize,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Fetch, Stage::Parse, Stage::Normalize];

    /// Command name of the stage (also the stage file stem in a site dir).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Parse => "parse",
            Self::Normalize => "normalize",
        }
    }

    /// Directory under `<region>/<site>/` holding this stage's run dirs.
    pub fn output_dir_name(&self) -> &'static str {
        match self {
            Self::Fetch => "raw",
            Self::Parse => "parsed",
            Self::Normalize => "normalized",
        }
    }

    /// Expected file suffix for artifacts produced by this stage.
    pub fn output_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Fetch => None,
            Self::Parse => Some(".parsed.ndjson"),
            Self::Normalize => Some(".normalized.ndjson"),
        }
    }

    /// The stage whose output feeds this one.
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Self::Fetch => None,
            Self::Parse => Some(Self::Fetch),
            Self::Normalize => Some(Self::Parse),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(Self::Fetch),
            "parse" => Ok(Self::Parse),
            "normalize" => Ok(Self::Normalize),
            other => Err(IngestError::config(format!("unknown stage '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// SiteId
// ---------------------------------------------------------------------------

/// A data source, identified by `(region, site)`. Rendered as `region/site`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SiteId {
    pub region: String,
    pub site: String,
}

impl SiteId {
    pub fn new(region: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            site: site.into(),
        }
    }

    /// Store prefix owned by this site: `<region>/<site>`.
    pub fn store_prefix(&self) -> String {
        format!("{}/{}", self.region, self.site)
    }

    /// Store directory holding all run dirs of `stage` for this site.
    pub fn stage_dir(&self, stage: Stage) -> String {
        format!("{}/{}", self.store_prefix(), stage.output_dir_name())
    }

    /// Store directory for one stage execution of one run.
    pub fn run_dir(&self, stage: Stage, run: &RunTimestamp) -> String {
        format!("{}/{}", self.stage_dir(stage), run)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.site)
    }
}

impl FromStr for SiteId {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((region, site))
                if !region.is_empty() && !site.is_empty() && !site.contains('/') =>
            {
                Ok(Self::new(region, site))
            }
            _ => Err(IngestError::config(format!(
                "invalid site '{s}': expected <region>/<site>"
            ))),
        }
    }
}

impl From<SiteId> for String {
    fn from(id: SiteId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SiteId {
    type Error = IngestError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// RunTimestamp
// ---------------------------------------------------------------------------

/// Name of the run directory shared by every stage execution of one invocation.
///
/// Second precision, UTC, e.g. `2024-03-01T12:30:05`. Lexicographic order is
/// chronological order. Timestamps handed out by [`RunTimestamp::now`] within
/// one process are strictly increasing, so two runs started in the same
/// second still get distinct directories.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunTimestamp(String);

impl RunTimestamp {
    /// Timestamp for a run starting now, later than any issued before it.
    pub fn now() -> Self {
        Self::from_datetime(next_issue(Utc::now()))
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format("%Y-%m-%dT%H:%M:%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Last run time handed out by this process.
static LAST_ISSUED: Mutex<Option<DateTime<Utc>>> = Mutex::new(None);

fn next_issue(now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.with_nanosecond(0).unwrap_or(now);
    let mut last = LAST_ISSUED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let issued = match *last {
        Some(prev) if prev >= now => prev + TimeDelta::seconds(1),
        _ => now,
    };
    *last = Some(issued);
    issued
}

impl fmt::Display for RunTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

/// Whether an artifact (or run directory) name is visible to the pipeline.
///
/// Names starting with `.` or `_` are private to the stage that wrote them.
pub fn is_visible(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.starts_with('_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stage_order_and_navigation() {
        assert!(Stage::Fetch < Stage::Parse);
        assert!(Stage::Parse < Stage::Normalize);
        assert_eq!(Stage::Fetch.previous(), None);
        assert_eq!(Stage::Normalize.previous(), Some(Stage::Parse));
    }

    #[test]
    fn stage_parse_and_display() {
        for stage in Stage::ALL {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
        }
        assert!("enrich".parse::<Stage>().is_err());
    }

    #[test]
    fn site_id_parsing() {
        let id: SiteId = "ca/sf_gov".parse().unwrap();
        assert_eq!(id.region, "ca");
        assert_eq!(id.site, "sf_gov");
        assert_eq!(id.to_string(), "ca/sf_gov");

        assert!("sf_gov".parse::<SiteId>().is_err());
        assert!("/sf_gov".parse::<SiteId>().is_err());
        assert!("ca/".parse::<SiteId>().is_err());
        assert!("ca/sf/gov".parse::<SiteId>().is_err());
    }

    #[test]
    fn site_id_serializes_as_string() {
        let id = SiteId::new("ri", "arcgis");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ri/arcgis\"");
        let back: SiteId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn run_dir_layout() {
        let at = Utc.with_ymd_and_hms(2021, 4, 1, 9, 5, 3).unwrap();
        let run = RunTimestamp::from_datetime(at);
        assert_eq!(run.as_str(), "2021-04-01T09:05:03");

        let id = SiteId::new("ca", "sf_gov");
        assert_eq!(
            id.run_dir(Stage::Parse, &run),
            "ca/sf_gov/parsed/2021-04-01T09:05:03"
        );
        assert_eq!(id.stage_dir(Stage::Fetch), "ca/sf_gov/raw");
    }

    #[test]
    fn run_timestamps_in_one_second_are_distinct() {
        let first = RunTimestamp::now();
        let second = RunTimestamp::now();
        let third = RunTimestamp::now();
        assert!(first < second, "{first} !< {second}");
        assert!(second < third, "{second} !< {third}");
    }

    #[test]
    fn visibility_rule() {
        assert!(is_visible("locations.parsed.ndjson"));
        assert!(!is_visible(".tmp"));
        assert!(!is_visible("_meta.json"));
        assert!(!is_visible(""));
    }
}
