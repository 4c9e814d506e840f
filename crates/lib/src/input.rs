//! Classification of target inputs: files, labels, and sliced outputs.

use crate::error::{Error, Result};
use crate::glob::PackageBoundary;
use crate::label::{self, BuildLabel};

/// One input to a build target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildInput {
  /// A file owned by the declaring package.
  File { package: String, file: String },
  /// All outputs of another target.
  Target(BuildLabel),
  /// A single named file among another target's outputs.
  TargetFile { label: BuildLabel, file: String },
  /// The slice of another target's outputs registered under a name,
  /// written `//pkg:name|sub`.
  SubOutput { label: BuildLabel, output: String },
}

impl BuildInput {
  /// The label this input depends on, if it refers to another target.
  pub fn label(&self) -> Option<&BuildLabel> {
    match self {
      BuildInput::File { .. } => None,
      BuildInput::Target(label) => Some(label),
      BuildInput::TargetFile { label, .. } => Some(label),
      BuildInput::SubOutput { label, .. } => Some(label),
    }
  }

  /// The repo-relative path of a plain file input.
  pub fn file_path(&self) -> Option<String> {
    match self {
      BuildInput::File { package, file } if package.is_empty() => Some(file.clone()),
      BuildInput::File { package, file } => Some(format!("{package}/{file}")),
      _ => None,
    }
  }
}

/// Parse an incoming source string as either a file or a build label.
///
/// Files must stay inside the declaring package: `../` components and absolute
/// paths are rejected outright, and a path into a subdirectory fails if any
/// directory between it and the package root is itself a package.
pub fn parse_source(src: &str, package: &str, boundary: &PackageBoundary) -> Result<BuildInput> {
  if label::looks_like_label(src) {
    if let Some((head, output)) = src.split_once('|') {
      let label = BuildLabel::parse(head, package)?;
      return Ok(BuildInput::SubOutput {
        label,
        output: output.to_string(),
      });
    }
    let (label, file) = BuildLabel::parse_file(src, package)?;
    return Ok(match file {
      Some(file) => BuildInput::TargetFile { label, file },
      None => BuildInput::Target(label),
    });
  }
  if src.contains("../") {
    return Err(Error::InvalidPath {
      package: package.to_string(),
      path: src.to_string(),
    });
  }
  if src.starts_with('/') {
    return Err(Error::AbsolutePath {
      package: package.to_string(),
      path: src.to_string(),
    });
  }
  if src.contains('/') {
    // The file is in a subdirectory; check nobody else owns it.
    let full = if package.is_empty() {
      src.to_string()
    } else {
      format!("{package}/{src}")
    };
    let mut dir = parent_dir(&full);
    while dir != package && !dir.is_empty() {
      if boundary.is_package(dir) {
        return Err(Error::CrossPackageFile {
          package: package.to_string(),
          file: src.to_string(),
          owner: dir.to_string(),
        });
      }
      dir = parent_dir(dir);
    }
  }
  Ok(BuildInput::File {
    package: package.to_string(),
    file: src.to_string(),
  })
}

fn parent_dir(path: &str) -> &str {
  path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}
