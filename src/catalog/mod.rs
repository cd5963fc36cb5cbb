//! Program catalog.
//!
//! The catalog is an in-memory snapshot of the declarative program file
//! (`config.yaml`): two program collections (`scripts`, `bots`) plus a
//! `settings` block. Snapshots are immutable; [`Catalog::snapshot`] hands
//! out the current one and transparently reloads when the file on disk has
//! changed, so an edited catalog is visible to the next submission without
//! a process restart. An in-flight execution keeps whatever snapshot it
//! resolved against.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Informational tag distinguishing one-shot scripts from long-running bots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramKind {
    Script,
    Bot,
}

impl std::fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script => write!(f, "script"),
            Self::Bot => write!(f, "bot"),
        }
    }
}

/// A user-declared unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Program {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Program directory; relative paths resolve against the project base.
    pub path: PathBuf,
    /// Declared entry file. Fallbacks apply when it does not exist.
    pub main_file: String,
    pub enabled: bool,
    /// Container image override; the global default applies when absent.
    pub image: Option<String>,
    /// Literal argv suffix appended to the main-file invocation.
    pub parameters: Option<String>,
    /// When set, the execution runs in compose mode and `image`/`main_file`
    /// are ignored.
    pub compose_path: Option<String>,
    pub kind: ProgramKind,
}

impl Program {
    /// Program directory resolved against `base` (absolute paths win).
    pub fn program_dir(&self, base: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            base.join(&self.path)
        }
    }

    /// Resolved compose file path, if this program runs in compose mode.
    /// Relative compose paths resolve against the program directory.
    pub fn compose_file(&self, base: &Path) -> Option<PathBuf> {
        let declared = self.compose_path.as_deref()?;
        let declared = Path::new(declared);
        if declared.is_absolute() {
            Some(declared.to_path_buf())
        } else {
            Some(self.program_dir(base).join(declared))
        }
    }
}

pub const DEFAULT_MAIN_FILE: &str = "main.py";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

fn default_image() -> String {
    "crucible-base".to_string()
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_memory_limit() -> String {
    "1g".to_string()
}

fn default_cpu_limit() -> String {
    "0.5".to_string()
}

/// Global execution settings from the catalog's `settings` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Image used by programs without an explicit `docker_image`.
    #[serde(default = "default_image")]
    pub docker_image: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    /// Container memory ceiling, e.g. "1g" or "512m".
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// Container CPU ceiling in fractional cores, e.g. "0.5".
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            docker_image: default_image(),
            timeout_seconds: default_timeout_seconds(),
            max_concurrent_executions: default_max_concurrent(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
        }
    }
}

impl GlobalSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

// -- On-disk shape --

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    settings: GlobalSettings,
    #[serde(default)]
    scripts: HashMap<String, ProgramEntry>,
    #[serde(default)]
    bots: HashMap<String, ProgramEntry>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ProgramEntry {
    /// Optional explicit id; the collection key is used when absent.
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    path: String,
    main_file: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    docker_image: Option<String>,
    parameters: Option<String>,
    path_docker_compose_run: Option<String>,
}

impl ProgramEntry {
    fn into_program(self, key: &str, kind: ProgramKind) -> Program {
        let id = self.id.unwrap_or_else(|| key.to_string());
        Program {
            name: if self.name.is_empty() {
                id.clone()
            } else {
                self.name
            },
            id,
            description: self.description,
            path: PathBuf::from(self.path),
            main_file: self
                .main_file
                .unwrap_or_else(|| DEFAULT_MAIN_FILE.to_string()),
            enabled: self.enabled,
            image: self.docker_image,
            parameters: self.parameters,
            compose_path: self.path_docker_compose_run,
            kind,
        }
    }
}

/// One parsed catalog state. Cheap to clone behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    programs: HashMap<String, Program>,
    order: Vec<String>,
    pub settings: GlobalSettings,
}

impl CatalogSnapshot {
    fn from_file(file: CatalogFile) -> Result<Self, CatalogError> {
        let mut programs = HashMap::new();

        let tagged = file
            .scripts
            .into_iter()
            .map(|(key, entry)| (key, entry, ProgramKind::Script))
            .chain(
                file.bots
                    .into_iter()
                    .map(|(key, entry)| (key, entry, ProgramKind::Bot)),
            );

        for (key, entry, kind) in tagged {
            let program = entry.into_program(&key, kind);
            if programs.contains_key(&program.id) {
                return Err(CatalogError::DuplicateProgram(program.id));
            }
            programs.insert(program.id.clone(), program);
        }

        let mut order: Vec<String> = programs.keys().cloned().collect();
        order.sort();

        Ok(Self {
            programs,
            order,
            settings: file.settings,
        })
    }

    /// O(1) lookup by program id.
    pub fn lookup(&self, program_id: &str) -> Option<&Program> {
        self.programs.get(program_id)
    }

    /// All programs, ordered by id.
    pub fn all_programs(&self) -> impl Iterator<Item = &Program> {
        self.order.iter().filter_map(|id| self.programs.get(id))
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

#[derive(Debug)]
struct Loaded {
    snapshot: Arc<CatalogSnapshot>,
    modified: Option<SystemTime>,
}

/// Handle to the catalog file with transparent live reload.
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    state: RwLock<Loaded>,
}

impl Catalog {
    /// Load the catalog from `path`. Fails if the file is missing or
    /// malformed; later reload failures keep the previous snapshot instead.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let (snapshot, modified) = Self::parse(&path)?;
        tracing::info!(
            path = %path.display(),
            programs = snapshot.len(),
            "catalog loaded"
        );
        Ok(Self {
            path,
            state: RwLock::new(Loaded { snapshot, modified }),
        })
    }

    /// Current snapshot. Checks the file's mtime and reloads first when the
    /// file changed; a snapshot already handed out is never affected.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        let on_disk = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        {
            let state = self.state.read().expect("catalog lock poisoned");
            if on_disk.is_none() || on_disk == state.modified {
                return Arc::clone(&state.snapshot);
            }
        }

        if let Err(e) = self.reload() {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "catalog reload failed, keeping previous snapshot"
            );
        }
        let state = self.state.read().expect("catalog lock poisoned");
        Arc::clone(&state.snapshot)
    }

    /// Force a reload from disk, replacing the snapshot atomically.
    pub fn reload(&self) -> Result<(), CatalogError> {
        let (snapshot, modified) = Self::parse(&self.path)?;
        tracing::info!(
            path = %self.path.display(),
            programs = snapshot.len(),
            "catalog reloaded"
        );
        let mut state = self.state.write().expect("catalog lock poisoned");
        *state = Loaded { snapshot, modified };
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(path: &Path) -> Result<(Arc<CatalogSnapshot>, Option<SystemTime>), CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CatalogFile =
            serde_yaml::from_str(&contents).map_err(|e| CatalogError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok((Arc::new(CatalogSnapshot::from_file(file)?), modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
settings:
  docker_image: crucible-base
  timeout_seconds: 120
  max_concurrent_executions: 3
  memory_limit: 512m
  cpu_limit: "0.25"
scripts:
  data_sync:
    name: Data sync
    description: Nightly sync job
    path: scripts/data_sync
    main_file: sync.py
    parameters: "--full"
  reporter:
    path: scripts/reporter
    enabled: false
    docker_image: reporter:2
bots:
  trader:
    path: bots/trader
    path_docker_compose_run: docker-compose.yml
"#;

    fn write_catalog(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn parses_programs_and_settings() {
        let (_dir, path) = write_catalog(SAMPLE);
        let catalog = Catalog::load(&path).unwrap();
        let snapshot = catalog.snapshot();

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.settings.timeout_seconds, 120);
        assert_eq!(snapshot.settings.max_concurrent_executions, 3);

        let sync = snapshot.lookup("data_sync").unwrap();
        assert_eq!(sync.main_file, "sync.py");
        assert_eq!(sync.parameters.as_deref(), Some("--full"));
        assert_eq!(sync.kind, ProgramKind::Script);
        assert!(sync.enabled);

        let trader = snapshot.lookup("trader").unwrap();
        assert_eq!(trader.kind, ProgramKind::Bot);
        assert_eq!(trader.main_file, DEFAULT_MAIN_FILE);
        assert!(trader.compose_path.is_some());
    }

    #[test]
    fn disabled_programs_stay_visible() {
        let (_dir, path) = write_catalog(SAMPLE);
        let catalog = Catalog::load(&path).unwrap();
        let snapshot = catalog.snapshot();

        let reporter = snapshot.lookup("reporter").unwrap();
        assert!(!reporter.enabled);
        assert_eq!(reporter.image.as_deref(), Some("reporter:2"));
        assert!(snapshot.all_programs().any(|p| p.id == "reporter"));
    }

    #[test]
    fn settings_default_when_block_missing() {
        let (_dir, path) = write_catalog("scripts:\n  a:\n    path: scripts/a\n");
        let catalog = Catalog::load(&path).unwrap();
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.settings.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(snapshot.settings.docker_image, "crucible-base");
    }

    #[test]
    fn explicit_id_wins_over_key() {
        let (_dir, path) =
            write_catalog("scripts:\n  some_key:\n    id: real_id\n    path: scripts/x\n");
        let catalog = Catalog::load(&path).unwrap();
        let snapshot = catalog.snapshot();
        assert!(snapshot.lookup("real_id").is_some());
        assert!(snapshot.lookup("some_key").is_none());
    }

    #[test]
    fn duplicate_id_across_collections_is_rejected() {
        let (_dir, path) = write_catalog(
            "scripts:\n  dup:\n    path: scripts/a\nbots:\n  dup:\n    path: bots/a\n",
        );
        let err = Catalog::load(&path).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateProgram(id) if id == "dup"));
    }

    #[test]
    fn relative_compose_path_resolves_against_program_dir() {
        let program = Program {
            id: "p".into(),
            name: "p".into(),
            description: String::new(),
            path: PathBuf::from("bots/trader"),
            main_file: DEFAULT_MAIN_FILE.into(),
            enabled: true,
            image: None,
            parameters: None,
            compose_path: Some("compose/stack.yml".into()),
            kind: ProgramKind::Bot,
        };
        assert_eq!(
            program.compose_file(Path::new("/app")).unwrap(),
            PathBuf::from("/app/bots/trader/compose/stack.yml")
        );
    }

    #[test]
    fn absolute_paths_are_kept() {
        let program = Program {
            id: "p".into(),
            name: "p".into(),
            description: String::new(),
            path: PathBuf::from("/opt/external/job"),
            main_file: DEFAULT_MAIN_FILE.into(),
            enabled: true,
            image: None,
            parameters: None,
            compose_path: Some("/etc/stacks/job.yml".into()),
            kind: ProgramKind::Script,
        };
        assert_eq!(
            program.program_dir(Path::new("/app")),
            PathBuf::from("/opt/external/job")
        );
        assert_eq!(
            program.compose_file(Path::new("/app")).unwrap(),
            PathBuf::from("/etc/stacks/job.yml")
        );
    }

    #[test]
    fn reload_replaces_snapshot() {
        let (_dir, path) = write_catalog(SAMPLE);
        let catalog = Catalog::load(&path).unwrap();
        let before = catalog.snapshot();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "  late_addition:\n    path: scripts/late\n").unwrap();
        drop(file);

        catalog.reload().unwrap();
        let after = catalog.snapshot();

        assert!(after.lookup("late_addition").is_some());
        // a snapshot taken before the reload is unaffected
        assert!(before.lookup("late_addition").is_none());
    }

    #[test]
    fn snapshot_picks_up_changed_mtime() {
        let (_dir, path) = write_catalog(SAMPLE);
        let catalog = Catalog::load(&path).unwrap();
        assert!(catalog.snapshot().lookup("late_addition").is_none());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "  late_addition:\n    path: scripts/late\n").unwrap();
        file.flush().unwrap();
        // push the mtime unambiguously forward so the change is detected
        // regardless of filesystem timestamp granularity
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        assert!(catalog.snapshot().lookup("late_addition").is_some());
    }

    #[test]
    fn broken_rewrite_keeps_previous_snapshot() {
        let (_dir, path) = write_catalog(SAMPLE);
        let catalog = Catalog::load(&path).unwrap();

        std::fs::write(&path, ":::not yaml at all").unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        let snapshot = catalog.snapshot();
        assert!(snapshot.lookup("data_sync").is_some());
    }
}
