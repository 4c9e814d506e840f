//! The engine value threaded through every operation.
//!
//! All shared state lives here rather than in process-wide globals: the build
//! graph behind a readers-writer lock, packages still being parsed, the
//! deferred-parse index, the package-boundary memo, and the artifact cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::cache::DirCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::glob::PackageBoundary;
use crate::graph::BuildGraph;
use crate::label::BuildLabel;
use crate::package::Package;
use crate::target::{TargetState, is_visible};

pub struct Engine {
  pub config: Config,
  pub root: PathBuf,
  pub graph: RwLock<BuildGraph>,
  /// Packages between their first parse attempt and successful registration.
  /// Partial state survives a deferred parse restart.
  pending: Mutex<HashMap<String, Package>>,
  /// Deferred parses keyed by the label each package is waiting on.
  deferred: Mutex<BTreeMap<BuildLabel, BTreeSet<String>>>,
  pub boundary: PackageBoundary,
  pub cache: Option<DirCache>,
}

impl Engine {
  pub fn new(config: Config, root: impl Into<PathBuf>) -> Result<Arc<Self>> {
    let root = root.into();
    let cache = if config.cache.dir.is_empty() {
      None
    } else {
      Some(DirCache::new(&config.cache, &root)?)
    };
    let boundary = PackageBoundary::new(&root, config.build.build_file_names.clone());
    Ok(Arc::new(Self {
      config,
      root,
      graph: RwLock::new(BuildGraph::new()),
      pending: Mutex::new(HashMap::new()),
      deferred: Mutex::new(BTreeMap::new()),
      boundary,
      cache,
    }))
  }

  /// Create the under-construction record for a package unless it is already
  /// pending or registered.
  pub fn ensure_pending(&self, name: &str) {
    let mut pending = self.pending.lock().expect("pending lock poisoned");
    if !pending.contains_key(name)
      && self
        .graph
        .read()
        .expect("graph lock poisoned")
        .package(name)
        .is_none()
    {
      pending.insert(name.to_string(), Package::new(name));
    }
  }

  /// Move a fully-parsed package into the graph. Write-once.
  pub fn commit_package(&self, name: &str) -> Result<()> {
    let package = self
      .pending
      .lock()
      .expect("pending lock poisoned")
      .remove(name)
      .unwrap_or_else(|| Package::new(name));
    self
      .graph
      .write()
      .expect("graph lock poisoned")
      .add_package(package)
  }

  /// Run `f` against a package record, wherever it currently lives: still
  /// pending, or already registered in the graph.
  pub fn with_package_mut<R>(&self, name: &str, f: impl FnOnce(&mut Package) -> Result<R>) -> Result<R> {
    let mut pending = self.pending.lock().expect("pending lock poisoned");
    if let Some(package) = pending.get_mut(name) {
      return f(package);
    }
    let mut graph = self.graph.write().expect("graph lock poisoned");
    if let Some(package) = graph.package_mut(name) {
      return f(package);
    }
    let package = pending.entry(name.to_string()).or_insert_with(|| Package::new(name));
    f(package)
  }

  /// Record that `package` cannot finish parsing until `blocker` is built.
  pub fn defer_parse(&self, blocker: BuildLabel, package: &str) {
    debug!(package, blocker = %blocker, "deferring parse");
    self
      .deferred
      .lock()
      .expect("deferred lock poisoned")
      .entry(blocker)
      .or_default()
      .insert(package.to_string());
  }

  /// Packages unblocked by `built` becoming Built, removed from the index.
  pub fn take_deferred(&self, built: &BuildLabel) -> Vec<String> {
    self
      .deferred
      .lock()
      .expect("deferred lock poisoned")
      .remove(built)
      .map(|packages| packages.into_iter().collect())
      .unwrap_or_default()
  }

  /// Whether a package is currently waiting on some target to build.
  pub fn is_deferred(&self, package: &str) -> bool {
    self
      .deferred
      .lock()
      .expect("deferred lock poisoned")
      .values()
      .any(|waiting| waiting.contains(package))
  }

  /// Packages still waiting in the deferral index.
  pub fn deferred_packages(&self) -> Vec<String> {
    let deferred = self.deferred.lock().expect("deferred lock poisoned");
    let mut packages: BTreeSet<String> = BTreeSet::new();
    for waiting in deferred.values() {
      packages.extend(waiting.iter().cloned());
    }
    packages.into_iter().collect()
  }

  /// Resolve the on-disk file a `subinclude(label)` call should load.
  ///
  /// Defers (recording the blocked package) when the target's package is
  /// unparsed or the target isn't built yet; otherwise the target must be
  /// visible to the caller and have exactly one output.
  pub fn resolve_subinclude(&self, from_package: &str, label: &BuildLabel) -> Result<PathBuf> {
    let graph = self.graph.read().expect("graph lock poisoned");
    let Some(target) = graph.target(label) else {
      // Might not have been parsed yet; that just means the caller waits.
      if graph.package(&label.package).is_none() {
        drop(graph);
        self.defer_parse(label.clone(), from_package);
        return Err(Error::Defer(label.clone()));
      }
      return Err(Error::UnknownTarget {
        package: label.package.clone(),
        name: label.name.clone(),
      });
    };
    let from = BuildLabel::new(from_package, "...");
    if !is_visible(target, &from) {
      return Err(Error::VisibilityViolation {
        label: label.clone(),
        from: from_package.to_string(),
      });
    }
    if target.outputs().len() != 1 {
      return Err(Error::MultipleOutputs(label.clone()));
    }
    if target.state() < TargetState::Built {
      drop(graph);
      self.defer_parse(label.clone(), from_package);
      return Err(Error::Defer(label.clone()));
    }
    Ok(self.root.join(target.out_dir()).join(&target.outputs()[0]))
  }

  /// Resolve an `include_defs` path label (`//path/to/file.lua`) under the
  /// repo root.
  pub fn resolve_include(&self, label: &str) -> Result<PathBuf> {
    let Some(rel) = label.strip_prefix("//") else {
      return Err(Error::Interpreter(
        "include_defs argument must be an absolute path (ie. start with //)".to_string(),
      ));
    };
    Ok(self.root.join(rel))
  }

  pub fn root(&self) -> &Path {
    &self.root
  }
}
