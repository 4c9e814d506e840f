//! The process-wide build graph.
//!
//! Targets live in an arena keyed by label; packages record which names belong
//! to them. Edges are the labels in each target's dependency set, resolved by
//! lookup, so the graph has no ownership cycles.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};
use crate::label::BuildLabel;
use crate::package::Package;
use crate::target::BuildTarget;

#[derive(Debug, Default)]
pub struct BuildGraph {
  packages: HashMap<String, Package>,
  targets: HashMap<BuildLabel, BuildTarget>,
}

impl BuildGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a parsed package. Packages are write-once.
  pub fn add_package(&mut self, package: Package) -> Result<()> {
    if self.packages.contains_key(&package.name) {
      return Err(Error::DuplicatePackage(package.name));
    }
    self.packages.insert(package.name.clone(), package);
    Ok(())
  }

  pub fn package(&self, name: &str) -> Option<&Package> {
    self.packages.get(name)
  }

  pub fn package_mut(&mut self, name: &str) -> Option<&mut Package> {
    self.packages.get_mut(name)
  }

  /// Add a target to the arena. Labels are unique across the graph.
  pub fn add_target(&mut self, target: BuildTarget) -> Result<()> {
    if self.targets.contains_key(&target.label) {
      return Err(Error::DuplicateTarget {
        package: target.label.package.clone(),
        name: target.label.name.clone(),
      });
    }
    self.targets.insert(target.label.clone(), target);
    Ok(())
  }

  pub fn target(&self, label: &BuildLabel) -> Option<&BuildTarget> {
    self.targets.get(label)
  }

  pub fn target_mut(&mut self, label: &BuildLabel) -> Option<&mut BuildTarget> {
    self.targets.get_mut(label)
  }

  pub fn targets(&self) -> impl Iterator<Item = &BuildTarget> {
    self.targets.values()
  }

  pub fn len(&self) -> usize {
    self.targets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }

  /// Record a dependency edge from one target to another.
  pub fn add_dependency(&mut self, from: &BuildLabel, to: BuildLabel) -> Result<()> {
    let target = self.targets.get_mut(from).ok_or_else(|| Error::UnknownTarget {
      package: from.package.clone(),
      name: from.name.clone(),
    })?;
    target.check_mutable()?;
    target.add_dependency(to);
    Ok(())
  }

  /// Topologically order the transitive closure of `roots`, dependencies
  /// first. Fails on a dangling edge or a cycle.
  pub fn build_order(&self, roots: &[BuildLabel]) -> Result<Vec<BuildLabel>> {
    let mut graph: DiGraph<BuildLabel, ()> = DiGraph::new();
    let mut nodes: HashMap<BuildLabel, NodeIndex> = HashMap::new();
    let mut queue: Vec<BuildLabel> = roots.to_vec();
    let mut seen: HashSet<BuildLabel> = HashSet::new();

    while let Some(label) = queue.pop() {
      if !seen.insert(label.clone()) {
        continue;
      }
      let target = self.targets.get(&label).ok_or_else(|| Error::UnknownTarget {
        package: label.package.clone(),
        name: label.name.clone(),
      })?;
      let idx = *nodes
        .entry(label.clone())
        .or_insert_with(|| graph.add_node(label.clone()));
      for dep in &target.dependencies {
        if self.targets.get(dep).is_none() {
          return Err(Error::MissingDependency {
            from: label.clone(),
            dep: dep.clone(),
          });
        }
        let dep_idx = *nodes
          .entry(dep.clone())
          .or_insert_with(|| graph.add_node(dep.clone()));
        graph.add_edge(dep_idx, idx, ());
        queue.push(dep.clone());
      }
    }

    let sorted =
      toposort(&graph, None).map_err(|cycle| Error::DependencyCycle(graph[cycle.node_id()].clone()))?;
    Ok(sorted.into_iter().map(|idx| graph[idx].clone()).collect())
  }

  /// Collect label suffixes with the given prefix from a target and all its
  /// transitive dependencies, deduplicated and sorted.
  pub fn transitive_labels(&self, label: &BuildLabel, prefix: &str) -> Vec<String> {
    let mut found: BTreeSet<String> = BTreeSet::new();
    let mut queue = vec![label.clone()];
    let mut seen: HashSet<BuildLabel> = HashSet::new();
    while let Some(current) = queue.pop() {
      if !seen.insert(current.clone()) {
        continue;
      }
      let Some(target) = self.targets.get(&current) else {
        continue;
      };
      for l in &target.labels {
        if let Some(suffix) = l.strip_prefix(prefix) {
          found.insert(suffix.trim().to_string());
        }
      }
      queue.extend(target.dependencies.iter().cloned());
    }
    found.into_iter().collect()
  }
}
