//! The build driver and the executor contract.
//!
//! Driving a single target:
//! 1. Pending → Building once its dependencies are Built
//! 2. run the pre-build function (it may rewrite the command)
//! 3. try the artifact cache, unless the target opts out
//! 4. otherwise create the out-dir and hand the target to the executor
//! 5. run the post-build function with the command's stdout
//! 6. store the artifacts and mark the target Built
//!
//! Any failure marks the target Failed and propagates.

use std::path::Path;

use tracing::{debug, info};

use crate::cache::key::rule_key;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::label::BuildLabel;
use crate::lua::runtime::Interpreter;
use crate::target::{BuildTarget, TargetState};
use crate::util::fs::create_dirs;

/// What the executor reports back for a target.
#[derive(Debug)]
pub enum ExecOutcome {
  /// The command ran; stdout is passed to the post-build function.
  Built { stdout: String },
  /// The executor satisfied the target from somewhere else (e.g. a remote
  /// cache); outputs are already in place.
  Cached,
  Failed { message: String },
}

/// The command executor. Receives a target whose dependencies are all Built
/// and the absolute out-dir its outputs must land in; how the command is
/// launched and sandboxed is its business.
pub trait Executor {
  fn execute(&mut self, target: &BuildTarget, out_dir: &Path) -> ExecOutcome;
}

/// What the driver did with a target.
#[derive(Debug)]
pub enum BuildResult {
  /// Built, or restored from the cache.
  Completed,
  /// The pre-build function added dependencies that aren't Built yet; the
  /// scheduler has to build them and come back.
  AwaitingDeps(Vec<BuildLabel>),
}

/// Build one target whose dependencies are already Built.
pub fn build_target(
  engine: &Engine,
  interp: &Interpreter,
  executor: &mut dyn Executor,
  label: &BuildLabel,
) -> Result<BuildResult> {
  // On a retry after AwaitingDeps the target is already Building and its
  // pre-build function has run.
  let first_attempt = {
    let graph = engine.graph.read().expect("graph lock poisoned");
    let target = graph.target(label).ok_or_else(|| unknown(label))?;
    target.state() < TargetState::Building
  };
  set_state(engine, label, TargetState::Pending)?;
  set_state(engine, label, TargetState::Building)?;

  if first_attempt
    && let Err(err) = interp.run_pre_build(label)
  {
    fail(engine, label);
    return Err(Error::BuildFailed {
      label: label.clone(),
      message: err.to_string(),
    });
  }

  let pending_deps: Vec<BuildLabel> = {
    let graph = engine.graph.read().expect("graph lock poisoned");
    let target = graph.target(label).ok_or_else(|| unknown(label))?;
    target
      .dependencies
      .iter()
      .filter(|dep| {
        graph
          .target(dep)
          .is_none_or(|t| t.state() < TargetState::Built)
      })
      .cloned()
      .collect()
  };
  if !pending_deps.is_empty() {
    debug!(target = %label, deps = pending_deps.len(), "pre-build function added unbuilt dependencies");
    return Ok(BuildResult::AwaitingDeps(pending_deps));
  }

  // The pre-build function may have rewritten the command, so the key is
  // computed after it runs.
  let (cache_key, skip_cache, out_dir) = {
    let graph = engine.graph.read().expect("graph lock poisoned");
    let target = graph.target(label).ok_or_else(|| unknown(label))?;
    let cache_key = rule_key(&graph, target, engine.root())?;
    (cache_key, target.skip_cache, engine.root().join(target.out_dir()))
  };

  if !skip_cache
    && let Some(cache) = &engine.cache
  {
    let graph = engine.graph.read().expect("graph lock poisoned");
    let target = graph.target(label).ok_or_else(|| unknown(label))?;
    if cache.retrieve(target, &cache_key) {
      drop(graph);
      info!(target = %label, "retrieved from cache");
      set_state(engine, label, TargetState::Built)?;
      return Ok(BuildResult::Completed);
    }
  }

  create_dirs(&out_dir)?;
  let outcome = {
    let graph = engine.graph.read().expect("graph lock poisoned");
    let target = graph.target(label).ok_or_else(|| unknown(label))?;
    debug!(target = %label, cmd = %target.command, "building");
    executor.execute(target, &out_dir)
  };

  match outcome {
    ExecOutcome::Failed { message } => {
      fail(engine, label);
      Err(Error::BuildFailed {
        label: label.clone(),
        message,
      })
    }
    ExecOutcome::Cached => {
      set_state(engine, label, TargetState::Built)?;
      Ok(BuildResult::Completed)
    }
    ExecOutcome::Built { stdout } => {
      if let Err(err) = interp.run_post_build(label, &stdout) {
        fail(engine, label);
        return Err(Error::BuildFailed {
          label: label.clone(),
          message: err.to_string(),
        });
      }
      if !skip_cache
        && let Some(cache) = &engine.cache
      {
        let graph = engine.graph.read().expect("graph lock poisoned");
        let target = graph.target(label).ok_or_else(|| unknown(label))?;
        cache.store(target, &cache_key);
      }
      set_state(engine, label, TargetState::Built)?;
      Ok(BuildResult::Completed)
    }
  }
}

fn set_state(engine: &Engine, label: &BuildLabel, state: TargetState) -> Result<()> {
  let mut graph = engine.graph.write().expect("graph lock poisoned");
  let target = graph.target_mut(label).ok_or_else(|| unknown(label))?;
  target.set_state(state);
  Ok(())
}

fn fail(engine: &Engine, label: &BuildLabel) {
  let mut graph = engine.graph.write().expect("graph lock poisoned");
  if let Some(target) = graph.target_mut(label) {
    target.set_state(TargetState::Failed);
  }
}

fn unknown(label: &BuildLabel) -> Error {
  Error::UnknownTarget {
    package: label.package.clone(),
    name: label.name.clone(),
  }
}

#[cfg(test)]
pub mod testing {
  use std::fs;

  use super::*;

  /// An executor that writes every declared output and returns a canned
  /// stdout, letting tests drive the engine without launching processes.
  pub struct FakeExecutor {
    pub stdout: String,
    pub executed: Vec<BuildLabel>,
    pub fail_on: Option<BuildLabel>,
    /// Contents written per target; targets not listed get a placeholder.
    pub file_contents: std::collections::HashMap<BuildLabel, String>,
  }

  impl FakeExecutor {
    pub fn new() -> Self {
      Self {
        stdout: String::new(),
        executed: Vec::new(),
        fail_on: None,
        file_contents: std::collections::HashMap::new(),
      }
    }

    pub fn with_stdout(stdout: &str) -> Self {
      Self {
        stdout: stdout.to_string(),
        ..Self::new()
      }
    }
  }

  impl Executor for FakeExecutor {
    fn execute(&mut self, target: &BuildTarget, out_dir: &Path) -> ExecOutcome {
      if self.fail_on.as_ref() == Some(&target.label) {
        return ExecOutcome::Failed {
          message: "told to fail".to_string(),
        };
      }
      self.executed.push(target.label.clone());
      let contents = self
        .file_contents
        .get(&target.label)
        .cloned()
        .unwrap_or_else(|| format!("output of {}", target.label));
      for out in target.cache_artifacts() {
        let path = out_dir.join(out);
        if let Some(parent) = path.parent()
          && let Err(err) = fs::create_dir_all(parent)
        {
          return ExecOutcome::Failed {
            message: err.to_string(),
          };
        }
        if let Err(err) = fs::write(&path, &contents) {
          return ExecOutcome::Failed {
            message: err.to_string(),
          };
        }
      }
      ExecOutcome::Built {
        stdout: self.stdout.clone(),
      }
    }
  }
}
