//! Transitive closure of R `source()` imports.
//!
//! A static scan, not an R parser: each file is searched for
//! `source("...")` calls and the referenced files are followed, with a
//! visited set and a bounded depth. Referenced paths are resolved first
//! against the R root (R's working-directory convention) and then
//! against the sourcing file's directory.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::Error;

const MAX_DEPTH: usize = 32;

static SOURCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"source\(\s*["']([^"']+)["']"#).expect("source pattern is valid"));

/// All R files reachable from `seeds` through `source()` calls,
/// lexicographically sorted. Seeds must exist; a sourced path that
/// cannot be found is skipped with a warning (it may be constructed at
/// runtime).
pub fn source_closure(seeds: &[Utf8PathBuf], root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, Error> {
    let mut visited: BTreeSet<Utf8PathBuf> = BTreeSet::new();
    let mut queue: Vec<(Utf8PathBuf, usize)> =
        seeds.iter().map(|path| (path.clone(), 0)).collect();

    while let Some((path, depth)) = queue.pop() {
        if !visited.insert(path.clone()) {
            continue;
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        if depth >= MAX_DEPTH {
            warn!("R import scan stopped at depth {MAX_DEPTH} in {path}");
            continue;
        }
        for capture in SOURCE_PATTERN.captures_iter(&contents) {
            let referenced = &capture[1];
            match locate(referenced, root, &path) {
                Some(resolved) => queue.push((resolved, depth + 1)),
                None => warn!("sourced file {referenced} (from {path}) not found, skipping"),
            }
        }
    }

    Ok(visited.into_iter().collect())
}

fn locate(referenced: &str, root: &Utf8Path, from: &Utf8Path) -> Option<Utf8PathBuf> {
    let from_root = root.join(referenced);
    if from_root.is_file() {
        return Some(from_root);
    }
    let sibling = from.parent()?.join(referenced);
    sibling.is_file().then_some(sibling)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write(root: &Utf8Path, name: &str, contents: &str) -> Utf8PathBuf {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn follows_source_calls_transitively() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let main = write(root, "clean/run.R", "source(\"lib/util.R\")\nx <- 1\n");
        write(root, "lib/util.R", "source('lib/deep.R')\n");
        write(root, "lib/deep.R", "y <- 2\n");

        let files = source_closure(&[main], root).unwrap();
        let names: Vec<&str> = files
            .iter()
            .map(|path| path.strip_prefix(root).unwrap().as_str())
            .collect();
        assert_eq!(names, vec!["clean/run.R", "lib/deep.R", "lib/util.R"]);
    }

    #[test]
    fn cyclic_sources_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let a = write(root, "a.R", "source(\"b.R\")\n");
        write(root, "b.R", "source(\"a.R\")\n");

        let files = source_closure(&[a], root).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn missing_sourced_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let a = write(root, "a.R", "source(\"ghost.R\")\n");

        let files = source_closure(&[a], root).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn sibling_relative_sources_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let main = write(root, "deep/run.R", "source(\"helper.R\")\n");
        write(root, "deep/helper.R", "z <- 3\n");

        let files = source_closure(&[main], root).unwrap();
        assert_eq!(files.len(), 2);
    }
}
