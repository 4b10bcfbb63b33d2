//! Runner registry: discovery of per-site stage implementations.
//!
//! Runners live in a fixed two-level namespace under a root directory:
//! `<root>/<region>/<site>/{fetch,parse,normalize}[.<ext>]`. The scan runs
//! once at the start of an invocation and produces an immutable [`Catalog`]
//! that is passed by reference for the rest of the run. Re-running the CLI
//! re-scans; there is no hot reload.

mod scan;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use feedingest_shared::{IngestError, Result, SiteId, Stage, is_visible};
use tracing::{debug, info, instrument, warn};

pub use scan::{CatalogProblem, ProblemKind, SHARED_DIR, StageCommand};

use scan::Probe;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// The stage implementations available for one site.
#[derive(Debug, Clone)]
pub struct Runner {
    pub site: SiteId,
    /// The site's directory inside the runners root.
    pub dir: PathBuf,
    stages: BTreeMap<Stage, StageCommand>,
}

impl Runner {
    /// Build a runner from an explicit stage set.
    pub fn new(site: SiteId, dir: impl Into<PathBuf>, stages: BTreeMap<Stage, StageCommand>) -> Self {
        Self {
            site,
            dir: dir.into(),
            stages,
        }
    }

    /// How this site implements `stage`, if it does.
    pub fn command(&self, stage: Stage) -> Option<&StageCommand> {
        self.stages.get(&stage)
    }

    pub fn implements(&self, stage: Stage) -> bool {
        self.stages.contains_key(&stage)
    }

    /// Implemented stages in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.keys().copied()
    }

    /// One-line capability summary, e.g. `ca/sf_gov fetch parse no-normalize`.
    pub fn describe(&self) -> String {
        let mut line = self.site.to_string();
        for stage in Stage::ALL {
            line.push(' ');
            if !self.implements(stage) {
                line.push_str("no-");
            }
            line.push_str(stage.as_str());
        }
        line
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Which sites an invocation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every site in the catalog.
    All,
    /// Every site in one region (case-insensitive).
    Region(String),
    /// Explicit sites.
    Sites(Vec<SiteId>),
}

impl Selector {
    /// Build a selector from CLI-style arguments.
    ///
    /// Site arguments are `region/site`; a bare `site` is accepted when a
    /// region is given.
    pub fn from_args(region: Option<&str>, sites: &[String]) -> Result<Self> {
        if sites.is_empty() {
            return Ok(match region {
                Some(r) => Self::Region(r.to_string()),
                None => Self::All,
            });
        }

        let ids = sites
            .iter()
            .map(|s| match (s.contains('/'), region) {
                (true, _) => s.parse(),
                (false, Some(r)) => Ok(SiteId::new(r, s.as_str())),
                (false, None) => Err(IngestError::config(format!(
                    "site '{s}' needs a region: use <region>/<site> or --region"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::Sites(ids))
    }
}

/// One entry of a resolved selection.
#[derive(Debug, Clone)]
pub enum Selection<'a> {
    Found(&'a Runner),
    /// An explicitly requested site with no runner.
    NotFound(SiteId),
}

impl Selection<'_> {
    pub fn site(&self) -> &SiteId {
        match self {
            Self::Found(runner) => &runner.site,
            Self::NotFound(site) => site,
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Immutable map of every discovered site to its runner.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    root: PathBuf,
    runners: BTreeMap<SiteId, Runner>,
    problems: Vec<CatalogProblem>,
}

impl Catalog {
    /// Scan `root` for `<region>/<site>` runner directories.
    ///
    /// Directories starting with `_` or `.` are skipped at both levels.
    /// Failing to read the root itself is fatal; anything below it is logged.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn scan(root: &Path) -> Result<Self> {
        let mut catalog = Self {
            root: root.to_path_buf(),
            ..Self::default()
        };

        for (region, region_dir) in visible_dirs(root)? {
            let sites = match visible_dirs(&region_dir) {
                Ok(sites) => sites,
                Err(e) => {
                    warn!(region = %region, error = %e, "skipping unreadable region directory");
                    continue;
                }
            };

            for (site_name, site_dir) in sites {
                let site = SiteId::new(region.as_str(), site_name);
                let runner = catalog.probe_site(site, site_dir);
                catalog.runners.insert(runner.site.clone(), runner);
            }
        }

        info!(
            sites = catalog.runners.len(),
            problems = catalog.problems.len(),
            "runner catalog built"
        );
        Ok(catalog)
    }

    fn probe_site(&mut self, site: SiteId, dir: PathBuf) -> Runner {
        let mut stages = BTreeMap::new();

        for stage in Stage::ALL {
            match scan::probe_stage(&self.root, &dir, stage) {
                Probe::Absent => {}
                Probe::Found(command) => {
                    debug!(site = %site, stage = %stage, program = %command.program().display(), "stage found");
                    stages.insert(stage, command);
                }
                Probe::Problem(kind) => {
                    let problem = CatalogProblem {
                        site: site.clone(),
                        stage,
                        kind,
                    };
                    match problem.kind {
                        ProblemKind::Ambiguous(_) => tracing::error!("{problem}"),
                        _ => warn!("{problem}"),
                    }
                    self.problems.push(problem);
                }
            }
        }

        Runner::new(site, dir, stages)
    }

    /// Build a catalog from prepared runners (embedding and tests).
    pub fn from_runners(root: impl Into<PathBuf>, runners: impl IntoIterator<Item = Runner>) -> Self {
        Self {
            root: root.into(),
            runners: runners.into_iter().map(|r| (r.site.clone(), r)).collect(),
            problems: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// All runners, ordered by site id.
    pub fn runners(&self) -> impl Iterator<Item = &Runner> {
        self.runners.values()
    }

    /// Stage files found but ignored during the scan.
    pub fn problems(&self) -> &[CatalogProblem] {
        &self.problems
    }

    /// Look up a site; the region matches case-insensitively.
    pub fn get(&self, site: &SiteId) -> Option<&Runner> {
        self.runners.get(site).or_else(|| {
            self.runners.values().find(|r| {
                r.site.region.eq_ignore_ascii_case(&site.region) && r.site.site == site.site
            })
        })
    }

    /// Like [`Catalog::get`], failing with `RunnerNotFound`.
    pub fn require(&self, site: &SiteId) -> Result<&Runner> {
        self.get(site).ok_or_else(|| IngestError::RunnerNotFound {
            selector: site.to_string(),
        })
    }

    /// Resolve a selector against the catalog.
    ///
    /// Explicit sites without a runner come back as [`Selection::NotFound`];
    /// duplicates are collapsed.
    pub fn select(&self, selector: &Selector) -> Vec<Selection<'_>> {
        match selector {
            Selector::All => self.runners.values().map(Selection::Found).collect(),
            Selector::Region(region) => self
                .runners
                .values()
                .filter(|r| r.site.region.eq_ignore_ascii_case(region))
                .map(Selection::Found)
                .collect(),
            Selector::Sites(sites) => {
                let mut seen = std::collections::HashSet::new();
                sites
                    .iter()
                    .filter_map(|site| match self.require(site) {
                        Ok(runner) => seen.insert(runner.site.clone()).then_some(Selection::Found(runner)),
                        Err(e) => {
                            warn!(error = %e, "requested site has no runner");
                            seen.insert(site.clone()).then(|| Selection::NotFound(site.clone()))
                        }
                    })
                    .collect()
            }
        }
    }
}

/// Visible sub-directories of `dir` as `(name, path)`, sorted by name.
fn visible_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = std::fs::read_dir(dir).map_err(|e| IngestError::io(dir, e))?;

    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| (e.file_name().to_string_lossy().to_string(), e.path()))
        .filter(|(name, _)| is_visible(name))
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fi-discovery-test-{}",
            uuid::Uuid::now_v7()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_script(path: &Path, executable: bool) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if executable { 0o755 } else { 0o644 };
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = executable;
    }

    #[test]
    fn scan_finds_sites_and_stages() {
        let root = temp_root();
        write_script(&root.join("ca/sf_gov/fetch.sh"), true);
        write_script(&root.join("ca/sf_gov/parse.py"), true);
        write_script(&root.join("ca/sf_gov/normalize.py"), true);
        write_script(&root.join("ri/arcgis/fetch"), true);
        std::fs::create_dir_all(root.join("_template/example")).unwrap();
        std::fs::create_dir_all(root.join("ca/.cache")).unwrap();

        let catalog = Catalog::scan(&root).unwrap();
        assert_eq!(catalog.len(), 2);

        let sf = catalog.get(&SiteId::new("ca", "sf_gov")).unwrap();
        assert_eq!(
            sf.stages().collect::<Vec<_>>(),
            vec![Stage::Fetch, Stage::Parse, Stage::Normalize]
        );
        assert_eq!(sf.describe(), "ca/sf_gov fetch parse normalize");

        let ri = catalog.get(&SiteId::new("ri", "arcgis")).unwrap();
        assert!(ri.implements(Stage::Fetch));
        assert!(!ri.implements(Stage::Parse));
        assert_eq!(ri.describe(), "ri/arcgis fetch no-parse no-normalize");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn scan_ignores_lookalike_names() {
        let root = temp_root();
        write_script(&root.join("ca/site/fetcher.sh"), true);
        write_script(&root.join("ca/site/parse_helpers.py"), true);
        write_script(&root.join("ca/site/fetch.sh"), true);

        let catalog = Catalog::scan(&root).unwrap();
        let runner = catalog.get(&SiteId::new("ca", "site")).unwrap();
        assert!(runner.implements(Stage::Fetch));
        assert!(!runner.implements(Stage::Parse));
        assert!(catalog.problems().is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn ambiguous_stage_is_a_problem_not_a_stage() {
        let root = temp_root();
        write_script(&root.join("ca/site/fetch.sh"), true);
        write_script(&root.join("ca/site/fetch.py"), true);

        let catalog = Catalog::scan(&root).unwrap();
        let runner = catalog.get(&SiteId::new("ca", "site")).unwrap();
        assert!(!runner.implements(Stage::Fetch));
        assert_eq!(catalog.problems().len(), 1);
        assert!(matches!(catalog.problems()[0].kind, ProblemKind::Ambiguous(_)));
        assert!(catalog.problems()[0].to_string().contains("too many fetch"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_stage_is_a_problem() {
        let root = temp_root();
        write_script(&root.join("ca/site/fetch.sh"), true);
        write_script(&root.join("ca/site/parse.py"), false);

        let catalog = Catalog::scan(&root).unwrap();
        let runner = catalog.get(&SiteId::new("ca", "site")).unwrap();
        assert!(runner.implements(Stage::Fetch));
        assert!(!runner.implements(Stage::Parse));
        assert!(matches!(
            catalog.problems()[0].kind,
            ProblemKind::NotExecutable(_)
        ));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn yml_stage_uses_shared_executable() {
        let root = temp_root();
        write_script(&root.join("_shared/fetch.py"), true);
        std::fs::create_dir_all(root.join("sc/arcgis")).unwrap();
        std::fs::write(root.join("sc/arcgis/fetch.yml"), "url: https://example.org\n").unwrap();
        std::fs::write(root.join("sc/arcgis/parse.yml"), "layer: 0\n").unwrap();

        let catalog = Catalog::scan(&root).unwrap();
        let runner = catalog.get(&SiteId::new("sc", "arcgis")).unwrap();

        match runner.command(Stage::Fetch).unwrap() {
            StageCommand::Shared { executable, config } => {
                assert!(executable.ends_with("_shared/fetch.py"));
                assert!(config.ends_with("sc/arcgis/fetch.yml"));
            }
            other => panic!("expected shared command, got {other:?}"),
        }

        // No shared parse executable exists.
        assert!(!runner.implements(Stage::Parse));
        assert!(matches!(
            catalog.problems()[0].kind,
            ProblemKind::MissingShared(_)
        ));
        // `_shared` is not a region.
        assert_eq!(catalog.len(), 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn scan_missing_root_is_an_error() {
        let root = std::env::temp_dir().join(format!("fi-missing-{}", uuid::Uuid::now_v7()));
        assert!(Catalog::scan(&root).is_err());
    }

    fn sample_catalog() -> Catalog {
        let fetch_only = |region: &str, site: &str| {
            let mut stages = BTreeMap::new();
            stages.insert(
                Stage::Fetch,
                StageCommand::Executable {
                    path: PathBuf::from(format!("/runners/{region}/{site}/fetch")),
                },
            );
            Runner::new(SiteId::new(region, site), format!("/runners/{region}/{site}"), stages)
        };
        Catalog::from_runners(
            "/runners",
            vec![
                fetch_only("ca", "sf_gov"),
                fetch_only("ca", "la_gov"),
                fetch_only("ri", "arcgis"),
            ],
        )
    }

    #[test]
    fn select_all_and_region() {
        let catalog = sample_catalog();
        assert_eq!(catalog.select(&Selector::All).len(), 3);

        let ca = catalog.select(&Selector::Region("CA".into()));
        let names: Vec<_> = ca.iter().map(|s| s.site().to_string()).collect();
        assert_eq!(names, vec!["ca/la_gov", "ca/sf_gov"]);

        assert!(catalog.select(&Selector::Region("tx".into())).is_empty());
    }

    #[test]
    fn select_explicit_sites_reports_missing() {
        let catalog = sample_catalog();
        let selector = Selector::Sites(vec![
            SiteId::new("ca", "sf_gov"),
            SiteId::new("ca", "nowhere"),
            SiteId::new("ca", "sf_gov"),
        ]);

        let selection = catalog.select(&selector);
        assert_eq!(selection.len(), 2);
        assert!(matches!(selection[0], Selection::Found(_)));
        assert!(matches!(&selection[1], Selection::NotFound(id) if id.site == "nowhere"));

        let err = catalog.require(&SiteId::new("ca", "nowhere")).unwrap_err();
        assert!(matches!(err, IngestError::RunnerNotFound { .. }));
    }

    #[test]
    fn selector_from_args() {
        assert_eq!(Selector::from_args(None, &[]).unwrap(), Selector::All);
        assert_eq!(
            Selector::from_args(Some("ca"), &[]).unwrap(),
            Selector::Region("ca".into())
        );
        assert_eq!(
            Selector::from_args(Some("ca"), &["sf_gov".into(), "ri/arcgis".into()]).unwrap(),
            Selector::Sites(vec![SiteId::new("ca", "sf_gov"), SiteId::new("ri", "arcgis")])
        );
        assert!(Selector::from_args(None, &["sf_gov".into()]).is_err());
    }
}
