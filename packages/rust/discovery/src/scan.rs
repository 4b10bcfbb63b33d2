//! Filesystem probing for stage implementations inside a site directory.

use std::fmt;
use std::path::{Path, PathBuf};

use feedingest_shared::{SiteId, Stage, is_visible};

/// Extension marking a stage config that runs through a shared executable.
const SHARED_CONFIG_EXT: &str = "yml";

/// Directory (under the runners root) holding shared stage executables.
pub const SHARED_DIR: &str = "_shared";

/// How a site implements one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageCommand {
    /// A site-specific executable invoked with `(output_dir[, input_dir])`.
    Executable { path: PathBuf },
    /// A shared executable driven by a per-site config file, appended as the
    /// last argument.
    Shared { executable: PathBuf, config: PathBuf },
}

impl StageCommand {
    /// Program to spawn.
    pub fn program(&self) -> &Path {
        match self {
            Self::Executable { path } => path,
            Self::Shared { executable, .. } => executable,
        }
    }

    /// Arguments that follow the output/input directories.
    pub fn trailing_args(&self) -> Vec<&Path> {
        match self {
            Self::Executable { .. } => Vec::new(),
            Self::Shared { config, .. } => vec![config.as_path()],
        }
    }
}

/// Why a stage file that is present could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProblemKind {
    /// More than one `<stage>.*` file in the site directory.
    Ambiguous(Vec<String>),
    /// The stage file lacks an execute bit.
    NotExecutable(PathBuf),
    /// A `<stage>.yml` exists but no shared executable handles it.
    MissingShared(PathBuf),
}

/// A stage file that was found but ignored during the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogProblem {
    pub site: SiteId,
    pub stage: Stage,
    pub kind: ProblemKind,
}

impl fmt::Display for CatalogProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ProblemKind::Ambiguous(names) => write!(
                f,
                "{}: too many {} commands ({})",
                self.site,
                self.stage,
                names.join(", ")
            ),
            ProblemKind::NotExecutable(path) => write!(
                f,
                "{}: {} is not marked as executable",
                self.site,
                path.display()
            ),
            ProblemKind::MissingShared(config) => write!(
                f,
                "{}: no shared {} executable to run {}",
                self.site,
                self.stage,
                config.display()
            ),
        }
    }
}

/// Outcome of probing one stage in one directory.
pub(crate) enum Probe {
    Absent,
    Found(StageCommand),
    Problem(ProblemKind),
}

/// Files in `dir` named `<stage>` or `<stage>.<ext>`, sorted.
fn stage_files(dir: &Path, stage: Stage) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let stem = stage.as_str();
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            is_visible(&name)
                && (name == stem
                    || name
                        .strip_prefix(stem)
                        .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1))
        })
        .map(|e| e.path())
        .collect();
    files.sort();
    files
}

fn is_config(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SHARED_CONFIG_EXT)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Find the single executable for `stage` in `dir`, ignoring config files.
fn find_executable(dir: &Path, stage: Stage) -> Probe {
    let files = stage_files(dir, stage);
    match files.as_slice() {
        [] => Probe::Absent,
        [single] if is_config(single) => Probe::Absent,
        [single] if is_executable(single) => Probe::Found(StageCommand::Executable {
            path: single.clone(),
        }),
        [single] => Probe::Problem(ProblemKind::NotExecutable(single.clone())),
        many => Probe::Problem(ProblemKind::Ambiguous(file_names(many))),
    }
}

/// Resolve how `site_dir` implements `stage`.
pub(crate) fn probe_stage(runners_root: &Path, site_dir: &Path, stage: Stage) -> Probe {
    let files = stage_files(site_dir, stage);
    match files.as_slice() {
        [] => Probe::Absent,
        [config] if is_config(config) => {
            match find_executable(&runners_root.join(SHARED_DIR), stage) {
                Probe::Found(StageCommand::Executable { path }) => {
                    Probe::Found(StageCommand::Shared {
                        executable: path,
                        config: config.clone(),
                    })
                }
                _ => Probe::Problem(ProblemKind::MissingShared(config.clone())),
            }
        }
        [_] => find_executable(site_dir, stage),
        many => Probe::Problem(ProblemKind::Ambiguous(file_names(many))),
    }
}

fn file_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect()
}
