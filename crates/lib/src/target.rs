//! Build targets and their lifecycle state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::input::BuildInput;
use crate::label::BuildLabel;
use crate::lua::hooks::HookHandle;

/// Lifecycle states, in increasing order. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TargetState {
  /// Created but nothing depends on it yet.
  Inactive,
  /// Depended upon by something being built.
  Active,
  /// All dependencies are Built; ready to run.
  Pending,
  /// The executor is running its command.
  Building,
  Built,
  Failed,
}

/// A named buildable entity within a package; the node of the build graph.
#[derive(Debug)]
pub struct BuildTarget {
  pub label: BuildLabel,
  pub command: String,
  pub test_command: String,
  pub is_binary: bool,
  pub is_test: bool,
  pub test_only: bool,
  pub needs_transitive_deps: bool,
  pub output_is_complete: bool,
  pub containerise: bool,
  pub no_test_output: bool,
  pub skip_cache: bool,
  pub flakiness: i32,
  pub build_timeout: i32,
  pub test_timeout: i32,
  pub building_description: Option<String>,
  pub sources: Vec<BuildInput>,
  pub named_sources: BTreeMap<String, Vec<BuildInput>>,
  pub data: Vec<BuildInput>,
  pub tools: Vec<BuildInput>,
  outputs: Vec<String>,
  pub dependencies: BTreeSet<BuildLabel>,
  pub exported_dependencies: BTreeSet<BuildLabel>,
  pub labels: Vec<String>,
  pub hashes: Vec<String>,
  pub licences: Vec<String>,
  pub test_outputs: Vec<String>,
  pub requires: Vec<String>,
  pub provides: BTreeMap<String, BuildLabel>,
  pub container_settings: BTreeMap<String, String>,
  pub visibility: Vec<BuildLabel>,
  pub pre_build: Option<HookHandle>,
  pub post_build: Option<HookHandle>,
  pub pre_build_hash: Option<Vec<u8>>,
  pub post_build_hash: Option<Vec<u8>>,
  state: TargetState,
}

impl BuildTarget {
  pub fn new(label: BuildLabel) -> Self {
    Self {
      label,
      command: String::new(),
      test_command: String::new(),
      is_binary: false,
      is_test: false,
      test_only: false,
      needs_transitive_deps: false,
      output_is_complete: false,
      containerise: false,
      no_test_output: false,
      skip_cache: false,
      flakiness: 0,
      build_timeout: 0,
      test_timeout: 0,
      building_description: None,
      sources: Vec::new(),
      named_sources: BTreeMap::new(),
      data: Vec::new(),
      tools: Vec::new(),
      outputs: Vec::new(),
      dependencies: BTreeSet::new(),
      exported_dependencies: BTreeSet::new(),
      labels: Vec::new(),
      hashes: Vec::new(),
      licences: Vec::new(),
      test_outputs: Vec::new(),
      requires: Vec::new(),
      provides: BTreeMap::new(),
      container_settings: BTreeMap::new(),
      visibility: Vec::new(),
      pre_build: None,
      post_build: None,
      pre_build_hash: None,
      post_build_hash: None,
      state: TargetState::Inactive,
    }
  }

  pub fn state(&self) -> TargetState {
    self.state
  }

  /// Advance the state machine. Transitions are monotonic, so a lower state
  /// than the current one is ignored.
  pub fn set_state(&mut self, next: TargetState) {
    if next > self.state {
      self.state = next;
    }
  }

  /// Modifying a target that's already built would race with consumers of its
  /// outputs.
  pub fn check_mutable(&self) -> Result<()> {
    if self.state >= TargetState::Built {
      return Err(Error::ImmutableBuiltTarget(self.label.clone()));
    }
    Ok(())
  }

  pub fn outputs(&self) -> &[String] {
    &self.outputs
  }

  /// Append an output, keeping declaration order and uniqueness.
  pub fn add_output(&mut self, output: &str) -> Result<()> {
    self.check_mutable()?;
    if !self.outputs.iter().any(|o| o == output) {
      self.outputs.push(output.to_string());
    }
    Ok(())
  }

  pub fn add_dependency(&mut self, dep: BuildLabel) {
    self.dependencies.insert(dep);
  }

  /// Exported dependencies are re-exposed to this target's dependents; every
  /// exported dependency is also a plain dependency.
  pub fn add_exported_dependency(&mut self, dep: BuildLabel) {
    self.dependencies.insert(dep.clone());
    self.exported_dependencies.insert(dep);
  }

  pub fn add_label(&mut self, label: &str) {
    if !self.labels.iter().any(|l| l == label) {
      self.labels.push(label.to_string());
    }
  }

  /// Requirements are also implicit labels.
  pub fn add_require(&mut self, require: &str) {
    self.requires.push(require.to_string());
    self.add_label(require);
  }

  pub fn add_licence(&mut self, licence: &str) {
    self.licences.push(licence.to_string());
  }

  pub fn add_named_source(&mut self, name: &str, source: BuildInput) {
    self.named_sources.entry(name.to_string()).or_default().push(source);
  }

  pub fn add_provide(&mut self, language: &str, label: BuildLabel) {
    self.provides.insert(language.to_string(), label);
  }

  /// The label a consumer requiring `language` should depend on instead.
  pub fn provide_for(&self, language: &str) -> Option<&BuildLabel> {
    self.provides.get(language)
  }

  pub fn set_container_setting(&mut self, key: &str, value: &str) {
    self.container_settings.insert(key.replace('_', ""), value.to_string());
  }

  /// Where this target's outputs are produced, relative to the repo root.
  pub fn out_dir(&self) -> PathBuf {
    let kind = if self.is_binary { "bin" } else { "gen" };
    PathBuf::from(format!("kiln-out/{kind}/{}", self.label.package))
  }

  /// The artifacts the cache stores for this target, in declaration order.
  pub fn cache_artifacts(&self) -> impl Iterator<Item = &str> {
    self.outputs.iter().map(String::as_str)
  }
}

/// Whether `target` may be depended upon (or subincluded) from `from`.
///
/// Targets are always visible within their own package; otherwise one of the
/// target's visibility patterns must cover the consumer.
pub fn is_visible(target: &BuildTarget, from: &BuildLabel) -> bool {
  if target.label.package == from.package {
    return true;
  }
  target.visibility.iter().any(|pattern| pattern.includes(from))
}
