//! Error types for the kiln engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::label::BuildLabel;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the engine.
///
/// Cache operations never surface these; they log and continue. Parse errors
/// abort the containing run. [`Error::Defer`] is an internal sentinel the
/// scheduler converts into a deferral and is never shown to a caller.
#[derive(Error, Debug, Clone)]
pub enum Error {
  #[error("duplicate build target in //{package}: {name}")]
  DuplicateTarget { package: String, name: String },

  #[error("package //{0} is already registered")]
  DuplicatePackage(String),

  #[error("output file {output} in //{package} is already owned by :{owner}")]
  DuplicateOutput {
    package: String,
    output: String,
    owner: String,
  },

  #[error("'{path}' (in package //{package}) is an invalid path; build target paths can't contain ../")]
  InvalidPath { package: String, path: String },

  #[error("'{path}' (in package //{package}) is an absolute path; that's not allowed")]
  AbsolutePath { package: String, path: String },

  #[error("package //{package} tries to use file {file}, but that belongs to another package (//{owner})")]
  CrossPackageFile {
    package: String,
    file: String,
    owner: String,
  },

  #[error("unknown build target {name} in //{package}")]
  UnknownTarget { package: String, name: String },

  #[error("attempted to modify target {0}, but it's already built")]
  ImmutableBuiltTarget(BuildLabel),

  #[error("target {label} is not visible to //{from}")]
  VisibilityViolation { label: BuildLabel, from: String },

  #[error("can't subinclude {0}; subinclude targets must have exactly one output")]
  MultipleOutputs(BuildLabel),

  #[error("{from} depends on {dep}, which is not in the graph")]
  MissingDependency { from: BuildLabel, dep: BuildLabel },

  #[error("dependency cycle involving {0}")]
  DependencyCycle(BuildLabel),

  #[error("subinclude cycle; these packages never resumed: {}", .0.join(", "))]
  SubincludeCycle(Vec<String>),

  #[error("no build file found for package //{0}")]
  MissingBuildFile(String),

  #[error("invalid build label '{0}'")]
  InvalidLabel(String),

  #[error("invalid glob pattern: {0}")]
  Glob(String),

  #[error("failed to parse {}: {message}", .file.display())]
  ParseFailed { file: PathBuf, message: String },

  #[error("{0}")]
  Interpreter(String),

  #[error("failed to build {label}: {message}")]
  BuildFailed { label: BuildLabel, message: String },

  #[error("I/O error: {0}")]
  Io(String),

  /// Sentinel raised when a parse must wait for a target to build.
  #[error("parse deferred waiting on {0}")]
  Defer(BuildLabel),
}

impl From<std::io::Error> for Error {
  fn from(err: std::io::Error) -> Self {
    Error::Io(err.to_string())
  }
}

impl From<Error> for mlua::Error {
  fn from(err: Error) -> Self {
    mlua::Error::external(err)
  }
}

impl Error {
  /// Recover a typed engine error from a Lua error chain.
  ///
  /// Callbacks raise engine errors via `mlua::Error::external`; by the time
  /// they surface from `exec()` they are wrapped in callback/context layers.
  /// Anything that is not an engine error becomes [`Error::Interpreter`]
  /// carrying the interpreter's diagnostic string.
  pub fn from_lua(err: &mlua::Error) -> Error {
    fn find(err: &mlua::Error) -> Option<Error> {
      match err {
        mlua::Error::CallbackError { cause, .. } => find(cause),
        mlua::Error::WithContext { cause, .. } => find(cause),
        mlua::Error::ExternalError(cause) => cause.downcast_ref::<Error>().cloned(),
        _ => None,
      }
    }
    find(err).unwrap_or_else(|| Error::Interpreter(err.to_string()))
  }
}
