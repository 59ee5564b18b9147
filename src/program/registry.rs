// SPDX-License-Identifier: Apache-2.0

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Compiler, Program};
use crate::error::{Error, Result};
use crate::metrics::{self, MetricStore};

#[derive(Clone)]
pub struct LoadedProgram {
    pub name: String,
    pub program: Arc<dyn Program>,
    pub loaded_at: DateTime<Utc>,
    /// File the program was loaded from, if any
    pub source_path: Option<PathBuf>,
}

impl std::fmt::Debug for LoadedProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedProgram")
            .field("name", &self.name)
            .field("loaded_at", &self.loaded_at)
            .field("source_path", &self.source_path)
            .finish()
    }
}

/// Immutable view of the loaded programs, keyed by name.
pub type ProgramSnapshot = Arc<BTreeMap<String, Arc<LoadedProgram>>>;

/// Outcome of loading a directory. One file failing never stops the others.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(PathBuf, Error)>,
    pub unloaded: Vec<String>,
}

impl LoadReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The set of currently loaded programs.
///
/// Readers take a snapshot with a single atomic load. Writers compile outside
/// any lock and publish a new map, so a reader sees either the old or the new
/// program, never a partial update.
pub struct ProgramRegistry {
    compiler: Arc<dyn Compiler>,
    programs: ArcSwap<BTreeMap<String, Arc<LoadedProgram>>>,
    store: Arc<MetricStore>,
}

impl ProgramRegistry {
    pub fn new(compiler: Arc<dyn Compiler>, store: Arc<MetricStore>) -> Self {
        Self {
            compiler,
            programs: ArcSwap::from_pointee(BTreeMap::new()),
            store,
        }
    }

    /// Compile `source` and install it under `name`, replacing any previous
    /// program of that name. On failure the previous program stays loaded.
    pub fn load(&self, name: &str, source: &str) -> Result<()> {
        self.install(name, source, None)
    }

    /// Load a single file. The program is named after the file name.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => {
                self.count_load_error();
                return Err(Error::Config(format!(
                    "program path has no file name: {:?}",
                    path
                )));
            }
        };

        let source = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                self.count_load_error();
                return Err(Error::ProgramRead {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        self.install(&name, &source, Some(path.to_path_buf()))
    }

    /// Load every eligible file directly inside `dir`: regular, not hidden,
    /// with the compiler's extension.
    pub fn load_directory(&self, dir: &Path) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let entries = fs::read_dir(dir)?.map(|entry| entry.map(|e| e.path()));
        let (files, errors) = self.eligible_files(entries);
        for e in errors {
            self.count_load_error();
            warn!(dir = ?dir, error = %e, "Failed to read program directory entry");
            report.failed.push((dir.to_path_buf(), Error::Io(e)));
        }

        for path in files {
            match self.load_file(&path) {
                Ok(()) => {
                    if let Some(name) = path.file_name() {
                        report.loaded.push(name.to_string_lossy().into_owned());
                    }
                }
                Err(e) => report.failed.push((path, e)),
            }
        }

        info!(
            dir = ?dir,
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Loaded program directory"
        );
        Ok(report)
    }

    /// Like [`load_directory`](Self::load_directory), and also unloads
    /// programs previously loaded from `dir` whose file is gone.
    pub fn reload_directory(&self, dir: &Path) -> Result<LoadReport> {
        let mut report = self.load_directory(dir)?;

        let stale: Vec<String> = self
            .snapshot()
            .values()
            .filter(|p| {
                p.source_path
                    .as_deref()
                    .is_some_and(|src| src.parent() == Some(dir) && !self.is_eligible(src))
            })
            .map(|p| p.name.clone())
            .collect();

        for name in stale {
            if self.unload(&name) {
                report.unloaded.push(name);
            }
        }

        Ok(report)
    }

    /// Remove a program. Returns whether it was loaded.
    pub fn unload(&self, name: &str) -> bool {
        let mut removed = false;
        self.programs.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            removed = next.remove(name).is_some();
            next
        });

        if removed {
            info!(program = name, "Unloaded program");
        }
        removed
    }

    pub fn snapshot(&self) -> ProgramSnapshot {
        self.programs.load_full()
    }

    pub fn names(&self) -> Vec<String> {
        self.programs.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.programs.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.load().is_empty()
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    fn install(&self, name: &str, source: &str, source_path: Option<PathBuf>) -> Result<()> {
        let program = match self.compiler.compile(name, source) {
            Ok(p) => p,
            Err(e) => {
                self.count_load_error();
                warn!(program = name, error = %e, "Failed to compile program");
                return Err(e.into());
            }
        };

        let loaded = Arc::new(LoadedProgram {
            name: name.to_string(),
            program,
            loaded_at: Utc::now(),
            source_path,
        });

        self.programs.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(name.to_string(), loaded.clone());
            next
        });

        info!(program = name, "Loaded program");
        Ok(())
    }

    /// Sorted eligible files, plus the entries that could not be read.
    fn eligible_files(
        &self,
        entries: impl Iterator<Item = io::Result<PathBuf>>,
    ) -> (Vec<PathBuf>, Vec<io::Error>) {
        let mut files = Vec::new();
        let mut errors = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if self.is_eligible(&path) => files.push(path),
                Ok(path) => debug!(path = ?path, "Skipping non-program file"),
                Err(e) => errors.push(e),
            }
        }
        files.sort();
        (files, errors)
    }

    fn is_eligible(&self, path: &Path) -> bool {
        let hidden = path
            .file_name()
            .is_none_or(|n| n.to_string_lossy().starts_with('.'));
        let ext_matches = path
            .extension()
            .is_some_and(|ext| ext == self.compiler.extension());

        !hidden && ext_matches && fs::metadata(path).is_ok_and(|m| m.is_file())
    }

    fn count_load_error(&self) {
        if let Ok(c) = self.store.counter(metrics::PROGRAM_LOAD_ERRORS) {
            c.inc();
        }
    }
}
