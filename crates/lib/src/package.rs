//! Packages: the unit of parsing.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// A directory containing a build file. Holds the names of its targets (the
/// targets themselves live in the graph arena, addressed by label), which
/// target owns each declared output file, and the subincludes it performed.
#[derive(Debug)]
pub struct Package {
  pub name: String,
  pub targets: BTreeSet<String>,
  outputs: BTreeMap<String, String>,
  pub subincludes: Vec<String>,
}

impl Package {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      targets: BTreeSet::new(),
      outputs: BTreeMap::new(),
      subincludes: Vec::new(),
    }
  }

  /// Record a target name; false if a target of that name already exists.
  pub fn register_target(&mut self, name: &str) -> bool {
    self.targets.insert(name.to_string())
  }

  /// Claim an output file for `target`. No two targets in a package may claim
  /// the same file; re-claiming by the same target is a no-op.
  pub fn register_output(&mut self, file: &str, target: &str) -> Result<()> {
    if let Some(owner) = self.outputs.get(file) {
      if owner != target {
        return Err(Error::DuplicateOutput {
          package: self.name.clone(),
          output: file.to_string(),
          owner: owner.clone(),
        });
      }
      return Ok(());
    }
    self.outputs.insert(file.to_string(), target.to_string());
    Ok(())
  }

  pub fn output_owner(&self, file: &str) -> Option<&str> {
    self.outputs.get(file).map(String::as_str)
  }

  pub fn register_subinclude(&mut self, source: &str) {
    self.subincludes.push(source.to_string());
  }
}
