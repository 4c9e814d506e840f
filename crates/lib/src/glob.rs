//! Glob expansion against a package directory.
//!
//! Patterns containing `**` are translated to a regex and matched against a
//! recursive walk; anything else goes through standard glob expansion. The
//! walk never descends into a subdirectory that is itself a package, since
//! those files belong to the other package.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use regex::Regex;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Answers "is this directory a package?" by probing for the configured
/// build-file names, memoized per directory.
pub struct PackageBoundary {
  root: PathBuf,
  build_file_names: Vec<String>,
  memo: Mutex<HashMap<PathBuf, bool>>,
}

impl PackageBoundary {
  pub fn new(root: impl Into<PathBuf>, build_file_names: Vec<String>) -> Self {
    Self {
      root: root.into(),
      build_file_names,
      memo: Mutex::new(HashMap::new()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Whether `dir` (relative to the repo root) contains a build file.
  pub fn is_package(&self, dir: impl AsRef<Path>) -> bool {
    let dir = dir.as_ref();
    let mut memo = self.memo.lock().expect("package memo lock poisoned");
    if let Some(&known) = memo.get(dir) {
      return known;
    }
    let result = self
      .build_file_names
      .iter()
      .any(|name| self.root.join(dir).join(name).is_file());
    memo.insert(dir.to_path_buf(), result);
    result
  }
}

/// Expand `includes` against the package directory, dropping matches that hit
/// an exclude pattern or (unless `include_hidden`) look hidden or temporary.
/// Matches are returned package-relative.
pub fn glob(
  boundary: &PackageBoundary,
  package: &str,
  includes: &[String],
  excludes: &[String],
  include_hidden: bool,
) -> Result<Vec<String>> {
  let mut results = Vec::new();
  for pattern in includes {
    for matched in expand(boundary, package, pattern)? {
      if !include_hidden {
        let base = matched.rsplit('/').next().unwrap_or(&matched);
        if base.starts_with('.') || (base.starts_with('#') && base.ends_with('#')) {
          continue;
        }
      }
      if is_excluded(&matched, package, excludes)? {
        continue;
      }
      let relative = matched
        .strip_prefix(package)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(&matched);
      results.push(relative.to_string());
    }
  }
  Ok(results)
}

/// Expand one pattern to repo-relative paths with forward slashes.
fn expand(boundary: &PackageBoundary, package: &str, pattern: &str) -> Result<Vec<String>> {
  let full = join(package, pattern);
  if !pattern.contains("**") {
    let on_disk = boundary.root().join(&full);
    let paths = ::glob::glob(&on_disk.to_string_lossy()).map_err(|e| Error::Glob(e.to_string()))?;
    let mut matches = Vec::new();
    for path in paths.flatten() {
      if path.is_file()
        && let Ok(rel) = path.strip_prefix(boundary.root())
      {
        matches.push(rel.to_string_lossy().replace('\\', "/"));
      }
    }
    return Ok(matches);
  }

  // Translate the pattern: `*` matches within a path component, `**` crosses
  // components, and `/**/` may match zero components.
  let mut translated = regex::escape(&full);
  translated = translated.replace(r"\*", "[^/]*");
  translated = translated.replace("[^/]*[^/]*", ".*");
  translated = translated.replace("/.*/", "/(?:.*/)?");
  let re = Regex::new(&format!("^{translated}$")).map_err(|e| Error::Glob(e.to_string()))?;

  let package_dir = boundary.root().join(package);
  let mut matches = Vec::new();
  let walker = WalkDir::new(&package_dir).into_iter().filter_entry(|entry| {
    // Can't glob past a package boundary.
    if entry.depth() == 0 || !entry.file_type().is_dir() {
      return true;
    }
    match entry.path().strip_prefix(boundary.root()) {
      Ok(rel) => !boundary.is_package(rel),
      Err(_) => true,
    }
  });
  for entry in walker.flatten() {
    if !entry.file_type().is_file() {
      continue;
    }
    if let Ok(rel) = entry.path().strip_prefix(boundary.root()) {
      let rel = rel.to_string_lossy().replace('\\', "/");
      if re.is_match(&rel) {
        matches.push(rel);
      }
    }
  }
  matches.sort();
  Ok(matches)
}

fn is_excluded(matched: &str, package: &str, excludes: &[String]) -> Result<bool> {
  for exclude in excludes {
    let pattern =
      ::glob::Pattern::new(&join(package, exclude)).map_err(|e| Error::Glob(e.to_string()))?;
    if pattern.matches(matched) {
      return Ok(true);
    }
  }
  Ok(false)
}

fn join(package: &str, path: &str) -> String {
  if package.is_empty() {
    path.to_string()
  } else {
    format!("{package}/{path}")
  }
}
