//! Cooperative parse/build scheduling with deferred-parse support.
//!
//! The scheduler drains a queue of `Parse(package)` and `Build(label)` items.
//! A parse that hits `subinclude` on an unbuilt target records itself in the
//! engine's deferral index and hands the blocker to the build side; when the
//! blocker becomes Built, every waiting package is re-enqueued and re-parsed
//! from the top of its build file. A queue that stops making progress is
//! diagnosed as either a dependency cycle or a subinclude cycle.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::build::{self, Executor};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::label::BuildLabel;
use crate::lua::runtime::{Interpreter, ParseOutcome};
use crate::target::{TargetState, is_visible};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Work {
  Parse(String),
  Build(BuildLabel),
}

enum Step {
  Done,
  Requeue { progressed: bool },
}

enum Inspection {
  PackageUnparsed,
  AlreadyBuilt,
  DepFailed(BuildLabel),
  Waiting(Vec<Work>),
  Ready,
}

pub struct Scheduler {
  engine: Arc<Engine>,
  interp: Interpreter,
}

impl Scheduler {
  pub fn new(engine: Arc<Engine>) -> Result<Self> {
    let interp = Interpreter::new(engine.clone())?;
    Ok(Self { engine, interp })
  }

  pub fn interpreter(&self) -> &Interpreter {
    &self.interp
  }

  pub fn engine(&self) -> &Arc<Engine> {
    &self.engine
  }

  /// Locate the build file for a package from the configured name list.
  fn build_file(&self, package: &str) -> Result<PathBuf> {
    for name in &self.engine.config.build.build_file_names {
      let path = if package.is_empty() {
        self.engine.root().join(name)
      } else {
        self.engine.root().join(package).join(name)
      };
      if path.is_file() {
        return Ok(path);
      }
    }
    Err(Error::MissingBuildFile(package.to_string()))
  }

  /// Parse one package. Success registers it in the graph (write-once); a
  /// deferral keeps its partial state pending and returns the blocking label.
  pub fn parse_package(&self, package: &str) -> Result<Option<BuildLabel>> {
    if self
      .engine
      .graph
      .read()
      .expect("graph lock poisoned")
      .package(package)
      .is_some()
    {
      return Ok(None);
    }
    let file = self.build_file(package)?;
    match self.interp.parse_file(&file, package) {
      ParseOutcome::Parsed => {
        self.engine.commit_package(package)?;
        debug!(package, "parsed package");
        Ok(None)
      }
      ParseOutcome::Deferred(label) => Ok(Some(label)),
      ParseOutcome::Failed(err) => Err(err),
    }
  }

  /// Parse and build the requested targets, interleaving deferred parses
  /// with the builds that unblock them. Aborts on the first error.
  pub fn run(&mut self, executor: &mut dyn Executor, requests: &[BuildLabel]) -> Result<()> {
    let mut queue: VecDeque<Work> = VecDeque::new();
    let mut queued: HashSet<Work> = HashSet::new();
    for label in requests {
      push(&mut queue, &mut queued, Work::Parse(label.package.clone()));
      push(&mut queue, &mut queued, Work::Build(label.clone()));
    }

    let mut stalled = 0usize;
    while let Some(work) = queue.pop_front() {
      queued.remove(&work);
      let step = match &work {
        Work::Parse(package) => self.step_parse(package, &mut queue, &mut queued)?,
        Work::Build(label) => self.step_build(executor, label, &mut queue, &mut queued)?,
      };
      match step {
        Step::Done => stalled = 0,
        Step::Requeue { progressed } => {
          push(&mut queue, &mut queued, work);
          if progressed {
            stalled = 0;
          } else {
            stalled += 1;
            if stalled > queue.len() * 2 + 2 {
              return Err(self.stall_report());
            }
          }
        }
      }
    }

    let leftover = self.engine.deferred_packages();
    if !leftover.is_empty() {
      return Err(Error::SubincludeCycle(leftover));
    }
    Ok(())
  }

  fn step_parse(&self, package: &str, queue: &mut VecDeque<Work>, queued: &mut HashSet<Work>) -> Result<Step> {
    // A package already sitting in the deferral index comes back by itself
    // when its blocker builds; parsing it again now would just defer again.
    if self.engine.is_deferred(package) {
      return Ok(Step::Requeue { progressed: false });
    }
    match self.parse_package(package)? {
      None => Ok(Step::Done),
      Some(blocker) => {
        debug!(package, blocker = %blocker, "parse deferred");
        if self
          .engine
          .graph
          .read()
          .expect("graph lock poisoned")
          .package(&blocker.package)
          .is_none()
          && !self.engine.is_deferred(&blocker.package)
        {
          push(queue, queued, Work::Parse(blocker.package.clone()));
        }
        push(queue, queued, Work::Build(blocker));
        Ok(Step::Done)
      }
    }
  }

  fn step_build(
    &self,
    executor: &mut dyn Executor,
    label: &BuildLabel,
    queue: &mut VecDeque<Work>,
    queued: &mut HashSet<Work>,
  ) -> Result<Step> {
    let inspection = self.inspect(label)?;
    match inspection {
      Inspection::PackageUnparsed => {
        if self.engine.is_deferred(&label.package) {
          return Ok(Step::Requeue { progressed: false });
        }
        let newly = push(queue, queued, Work::Parse(label.package.clone()));
        Ok(Step::Requeue { progressed: newly })
      }
      Inspection::AlreadyBuilt => {
        // The target may have been built while a deferral on it was being
        // recorded; resume any waiters either way.
        for package in self.engine.take_deferred(label) {
          debug!(package, unblocked_by = %label, "resuming deferred parse");
          push(queue, queued, Work::Parse(package));
        }
        Ok(Step::Done)
      }
      Inspection::DepFailed(dep) => Err(Error::BuildFailed {
        label: label.clone(),
        message: format!("dependency {dep} failed"),
      }),
      Inspection::Waiting(waiting) => {
        self.activate(label);
        let mut progressed = false;
        for work in waiting {
          if let Work::Parse(package) = &work
            && self.engine.is_deferred(package)
          {
            continue;
          }
          if let Work::Build(dep) = &work {
            self.activate(dep);
          }
          progressed |= push(queue, queued, work);
        }
        Ok(Step::Requeue { progressed })
      }
      Inspection::Ready => {
        self.activate(label);
        match build::build_target(&self.engine, &self.interp, executor, label)? {
          // The pre-build function grew the dependency set; the next attempt
          // goes back through inspection and queues them.
          build::BuildResult::AwaitingDeps(_) => Ok(Step::Requeue { progressed: true }),
          build::BuildResult::Completed => {
            info!(target = %label, "built");
            for package in self.engine.take_deferred(label) {
              debug!(package, unblocked_by = %label, "resuming deferred parse");
              push(queue, queued, Work::Parse(package));
            }
            Ok(Step::Done)
          }
        }
      }
    }
  }

  /// Work out what has to happen before `label` can build.
  fn inspect(&self, label: &BuildLabel) -> Result<Inspection> {
    let graph = self.engine.graph.read().expect("graph lock poisoned");
    if graph.package(&label.package).is_none() {
      return Ok(Inspection::PackageUnparsed);
    }
    let Some(target) = graph.target(label) else {
      return Err(Error::UnknownTarget {
        package: label.package.clone(),
        name: label.name.clone(),
      });
    };
    match target.state() {
      TargetState::Built => return Ok(Inspection::AlreadyBuilt),
      TargetState::Failed => {
        return Err(Error::BuildFailed {
          label: label.clone(),
          message: "target failed".to_string(),
        });
      }
      _ => {}
    }
    let mut waiting = Vec::new();
    for dep in &target.dependencies {
      match graph.target(dep) {
        None => {
          if graph.package(&dep.package).is_none() {
            waiting.push(Work::Parse(dep.package.clone()));
            waiting.push(Work::Build(dep.clone()));
          } else {
            return Err(Error::MissingDependency {
              from: label.clone(),
              dep: dep.clone(),
            });
          }
        }
        Some(dep_target) => {
          if !is_visible(dep_target, label) {
            return Err(Error::VisibilityViolation {
              label: dep.clone(),
              from: label.package.clone(),
            });
          }
          match dep_target.state() {
            TargetState::Failed => return Ok(Inspection::DepFailed(dep.clone())),
            TargetState::Built => {}
            _ => waiting.push(Work::Build(dep.clone())),
          }
        }
      }
    }
    if waiting.is_empty() {
      Ok(Inspection::Ready)
    } else {
      Ok(Inspection::Waiting(waiting))
    }
  }

  /// First use of a target activates it.
  fn activate(&self, label: &BuildLabel) {
    let mut graph = self.engine.graph.write().expect("graph lock poisoned");
    if let Some(target) = graph.target_mut(label) {
      target.set_state(TargetState::Active);
    }
  }

  /// Diagnose a queue that stopped making progress.
  fn stall_report(&self) -> Error {
    {
      let graph = self.engine.graph.read().expect("graph lock poisoned");
      let labels: Vec<BuildLabel> = graph.targets().map(|t| t.label.clone()).collect();
      match graph.build_order(&labels) {
        Err(err @ Error::DependencyCycle(_)) => return err,
        _ => {}
      }
    }
    let deferred = self.engine.deferred_packages();
    if !deferred.is_empty() {
      return Error::SubincludeCycle(deferred);
    }
    Error::Interpreter("scheduler stalled without making progress".to_string())
  }
}

fn push(queue: &mut VecDeque<Work>, queued: &mut HashSet<Work>, work: Work) -> bool {
  if queued.insert(work.clone()) {
    queue.push_back(work);
    true
  } else {
    false
  }
}
