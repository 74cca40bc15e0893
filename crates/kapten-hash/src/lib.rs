#![deny(clippy::all)]

//! Deterministic content fingerprints for task code, input artifacts,
//! and output artifacts.
//!
//! Same inputs produce the same fingerprint across runs and hosts: file
//! sets are sorted lexicographically before hashing and paths are stored
//! relative to their root.

mod fingerprint;
mod r_imports;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
pub use fingerprint::{canonical_json, fingerprint, fingerprint_str, hash_file};
use kapten_registry::TaskConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([a-zA-Z0-9\-_\.]+)\}").expect("var pattern is valid"));

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} script '{name}' not found under {searched:?}")]
    MissingSource {
        kind: SourceKind,
        name: String,
        searched: Vec<Utf8PathBuf>,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid output pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to serialize hash tree: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Python,
    R,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Python => write!(f, "Python"),
            SourceKind::R => write!(f, "R"),
        }
    }
}

/// One hashed file, path relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHash {
    pub path: String,
    pub hash: String,
}

/// Canonical serialization of a hash tree; the input to the derived
/// `*_version` fingerprints.
pub fn serialize_hashes<T: Serialize>(value: &T) -> Result<String, Error> {
    Ok(canonical_json(&serde_json::to_value(value)?))
}

/// Fingerprints task sources and artifacts given the configured
/// directory roots.
#[derive(Debug, Clone)]
pub struct Hasher {
    py_dirs: Vec<Utf8PathBuf>,
    r_dirs: Vec<Utf8PathBuf>,
    output_dir: Utf8PathBuf,
}

impl Hasher {
    pub fn new(py_dirs: Vec<Utf8PathBuf>, r_dirs: Vec<Utf8PathBuf>, output_dir: Utf8PathBuf) -> Self {
        Self {
            py_dirs,
            r_dirs,
            output_dir,
        }
    }

    /// Hash the single Python source file backing `task`.
    pub fn hash_py(&self, task_name: &str, task: &TaskConfig) -> Result<String, Error> {
        let filename = task.py_file_name(task_name);
        for dir in &self.py_dirs {
            let path = dir.join(&filename);
            if path.is_file() {
                return hash_file(&path);
            }
        }
        Err(Error::MissingSource {
            kind: SourceKind::Python,
            name: filename,
            searched: self.py_dirs.clone(),
        })
    }

    /// Hash the transitive set of R files reachable from the task's
    /// script via `source()` imports. `${var}` placeholders in the script
    /// path expand to `*` globs.
    pub fn hash_r(&self, task_name: &str, task: &TaskConfig) -> Result<Vec<FileHash>, Error> {
        let script = task
            .r_script
            .clone()
            .unwrap_or_else(|| format!("{task_name}/run.R"));
        let (seeds, root) = self.resolve_r_seeds(&script)?;
        let files = r_imports::source_closure(&seeds, &root)?;
        files
            .iter()
            .map(|path| {
                Ok(FileHash {
                    path: relativize(path, &root),
                    hash: hash_file(path)?,
                })
            })
            .collect()
    }

    /// The concrete script path for one invocation: `${var}` placeholders
    /// substituted from `env`, then searched across the R roots.
    pub fn resolve_r_script(
        &self,
        script: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<Utf8PathBuf, Error> {
        let filled = substitute_vars(script, Some(env));
        for dir in &self.r_dirs {
            let path = dir.join(&filled);
            if path.is_file() {
                return Ok(path);
            }
        }
        Err(Error::MissingSource {
            kind: SourceKind::R,
            name: filled,
            searched: self.r_dirs.clone(),
        })
    }

    fn resolve_r_seeds(&self, script: &str) -> Result<(Vec<Utf8PathBuf>, Utf8PathBuf), Error> {
        for dir in &self.r_dirs {
            if script.contains('$') {
                let pattern = dir.join(substitute_vars(script, None));
                let matches = expand_glob(pattern.as_str())?;
                if !matches.is_empty() {
                    return Ok((matches, dir.clone()));
                }
            } else {
                let path = dir.join(script);
                if path.is_file() {
                    return Ok((vec![path], dir.clone()));
                }
            }
        }
        Err(Error::MissingSource {
            kind: SourceKind::R,
            name: script.to_owned(),
            searched: self.r_dirs.clone(),
        })
    }

    /// Composite fingerprint of the task's declared output files.
    ///
    /// Returns `Some("")` when the task declares no outputs, and `None`
    /// when the declared patterns matched no files (not yet produced).
    pub fn hash_task_outputs(&self, task: &TaskConfig) -> Result<Option<String>, Error> {
        self.hash_outputs(task, None)
    }

    /// Like [`Hasher::hash_task_outputs`], with `${var}` placeholders
    /// filled from the subtask environment before globbing. Unbound
    /// variables still fall back to `*`.
    pub fn hash_subtask_outputs(
        &self,
        task: &TaskConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Option<String>, Error> {
        self.hash_outputs(task, Some(env))
    }

    fn hash_outputs(
        &self,
        task: &TaskConfig,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<Option<String>, Error> {
        let Some(patterns) = &task.outputs else {
            return Ok(Some(String::new()));
        };
        let mut files: BTreeSet<String> = BTreeSet::new();
        for pattern in patterns {
            let expanded = substitute_vars(pattern, env);
            if expanded.contains(['*', '?', '[']) {
                let full = self.output_dir.join(&expanded);
                let matches = expand_glob(full.as_str())?;
                if matches.is_empty() {
                    warn!("output pattern {full} matched no files");
                }
                files.extend(
                    matches
                        .iter()
                        .map(|path| relativize(path, &self.output_dir)),
                );
            } else if self.output_dir.join(&expanded).is_file() {
                files.insert(expanded);
            } else {
                warn!("output file {expanded} not found under {}", self.output_dir);
            }
        }
        if files.is_empty() {
            return Ok(None);
        }
        let hashed: Vec<FileHash> = files
            .into_iter()
            .map(|path| {
                let hash = hash_file(&self.output_dir.join(&path))?;
                Ok(FileHash { path, hash })
            })
            .collect::<Result<_, Error>>()?;
        Ok(Some(fingerprint(&serde_json::to_value(&hashed)?)))
    }
}

/// Replace `${var}` placeholders from `env`, falling back to `*`.
pub fn substitute_vars(pattern: &str, env: Option<&BTreeMap<String, String>>) -> String {
    VAR_PATTERN
        .replace_all(pattern, |captures: &regex::Captures<'_>| {
            env.and_then(|env| env.get(&captures[1]).cloned())
                .unwrap_or_else(|| "*".to_owned())
        })
        .into_owned()
}

fn expand_glob(pattern: &str) -> Result<Vec<Utf8PathBuf>, Error> {
    let paths = glob::glob(pattern).map_err(|source| Error::Pattern {
        pattern: pattern.to_owned(),
        source,
    })?;
    let mut matches = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => {
                if path.is_file() {
                    if let Ok(utf8) = Utf8PathBuf::try_from(path) {
                        matches.push(utf8);
                    }
                }
            }
            Err(err) => warn!("skipping unreadable glob match: {err}"),
        }
    }
    Ok(matches)
}

fn relativize(path: &Utf8Path, root: &Utf8Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .as_str()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn task(yaml: &str) -> TaskConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn write(root: &Utf8Path, name: &str, contents: &str) -> Utf8PathBuf {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        hasher: Hasher,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let hasher = Hasher::new(
            vec![root.join("py")],
            vec![root.join("r")],
            root.join("scratch"),
        );
        Fixture {
            _dir: dir,
            root,
            hasher,
        }
    }

    #[test]
    fn hash_py_changes_when_source_changes() {
        let fx = fixture();
        write(&fx.root, "py/alpha.py", "def alpha():\n    return 1\n");
        let task = task("py_script: true");
        let before = fx.hasher.hash_py("alpha", &task).unwrap();
        write(&fx.root, "py/alpha.py", "def alpha():\n    return 2\n");
        let after = fx.hasher.hash_py("alpha", &task).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn hash_py_missing_source_errors() {
        let fx = fixture();
        let err = fx.hasher.hash_py("ghost", &task("py_script: true")).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingSource {
                kind: SourceKind::Python,
                ..
            }
        ));
    }

    #[test]
    fn hash_r_includes_sourced_files_in_sorted_order() {
        let fx = fixture();
        write(&fx.root, "r/clean/run.R", "source(\"lib/util.R\")\n");
        write(&fx.root, "r/lib/util.R", "u <- 1\n");
        let hashes = fx
            .hasher
            .hash_r("clean", &task("r_script: clean/run.R"))
            .unwrap();
        let paths: Vec<&str> = hashes.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["clean/run.R", "lib/util.R"]);
    }

    #[test]
    fn hash_r_expands_placeholder_scripts() {
        let fx = fixture();
        write(&fx.root, "r/clean/run_ca.R", "a <- 1\n");
        write(&fx.root, "r/clean/run_ny.R", "b <- 2\n");
        let hashes = fx
            .hasher
            .hash_r("clean", &task("r_script: clean/run_${state}.R"))
            .unwrap();
        assert_eq!(hashes.len(), 2);
    }

    #[test]
    fn task_outputs_empty_when_none_declared() {
        let fx = fixture();
        let result = fx.hasher.hash_task_outputs(&task("py_script: true")).unwrap();
        assert_eq!(result, Some(String::new()));
    }

    #[test]
    fn task_outputs_none_when_nothing_produced() {
        let fx = fixture();
        let result = fx
            .hasher
            .hash_task_outputs(&task("outputs:\n- clean/${state}.csv\n"))
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn task_outputs_fingerprint_is_stable_across_declaration_order() {
        let fx = fixture();
        write(&fx.root, "scratch/a.csv", "1\n");
        write(&fx.root, "scratch/b.csv", "2\n");
        let forward = fx
            .hasher
            .hash_task_outputs(&task("outputs:\n- a.csv\n- b.csv\n"))
            .unwrap();
        let reverse = fx
            .hasher
            .hash_task_outputs(&task("outputs:\n- b.csv\n- a.csv\n"))
            .unwrap();
        assert_eq!(forward, reverse);
        assert!(forward.is_some());
    }

    #[test]
    fn subtask_outputs_substitute_environment_values() {
        let fx = fixture();
        write(&fx.root, "scratch/clean/ca.csv", "ca\n");
        write(&fx.root, "scratch/clean/ny.csv", "ny\n");
        let declared = task("outputs:\n- clean/${state}.csv\n");
        let env = BTreeMap::from([("state".to_owned(), "ca".to_owned())]);
        let ca = fx.hasher.hash_subtask_outputs(&declared, &env).unwrap();
        let env = BTreeMap::from([("state".to_owned(), "ny".to_owned())]);
        let ny = fx.hasher.hash_subtask_outputs(&declared, &env).unwrap();
        assert!(ca.is_some());
        assert_ne!(ca, ny);
    }

    #[test]
    fn unbound_variables_glob_everything() {
        let fx = fixture();
        write(&fx.root, "scratch/clean/ca.csv", "ca\n");
        write(&fx.root, "scratch/clean/ny.csv", "ny\n");
        let declared = task("outputs:\n- clean/${state}.csv\n");
        let all = fx
            .hasher
            .hash_subtask_outputs(&declared, &BTreeMap::new())
            .unwrap();
        let task_level = fx.hasher.hash_task_outputs(&declared).unwrap();
        assert_eq!(all, task_level);
    }
}
