//! Build-target identifiers.
//!
//! A label names a target as `//path/to/package:name`. `//pkg` abbreviates
//! `//pkg:pkg`, and `:name` resolves against a default package supplied by the
//! parse context. The wildcard name `...` matches every target under a package
//! subtree and only appears in visibility patterns.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildLabel {
  pub package: String,
  pub name: String,
}

impl BuildLabel {
  pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      package: package.into(),
      name: name.into(),
    }
  }

  /// Parse a label, resolving `:name` forms against `default_package`.
  pub fn parse(s: &str, default_package: &str) -> Result<Self> {
    let (label, file) = Self::parse_file(s, default_package)?;
    if file.is_some() {
      return Err(Error::InvalidLabel(s.to_string()));
    }
    Ok(label)
  }

  /// Parse a label that may carry a trailing file component,
  /// e.g. `//pkg:name/file.ext`.
  pub fn parse_file(s: &str, default_package: &str) -> Result<(Self, Option<String>)> {
    let (package, rest) = if let Some(rest) = s.strip_prefix("//") {
      match rest.split_once(':') {
        Some((package, name)) => (package.to_string(), name),
        None => {
          // `//pkg` abbreviates `//pkg:pkg`; `//pkg/...` is a subtree wildcard.
          if let Some(package) = rest.strip_suffix("/...") {
            return Ok((Self::new(package, "..."), None));
          }
          if rest == "..." {
            return Ok((Self::new("", "..."), None));
          }
          let name = rest.rsplit('/').next().unwrap_or(rest);
          (rest.to_string(), name)
        }
      }
    } else if let Some(name) = s.strip_prefix(':') {
      (default_package.to_string(), name)
    } else {
      return Err(Error::InvalidLabel(s.to_string()));
    };

    if package.starts_with('/') || package.ends_with('/') || package.contains(':') {
      return Err(Error::InvalidLabel(s.to_string()));
    }
    let (name, file) = match rest.split_once('/') {
      Some((name, file)) => (name, Some(file.to_string())),
      None => (rest, None),
    };
    if name.is_empty() || name.contains(':') || name.contains('|') {
      return Err(Error::InvalidLabel(s.to_string()));
    }
    Ok((Self::new(package, name), file))
  }

  /// Whether this label is a wildcard pattern rather than a concrete target.
  pub fn is_wildcard(&self) -> bool {
    self.name == "..."
  }

  /// Whether this label, treated as a pattern, covers `other`.
  ///
  /// `//pkg/...` covers every target in `pkg` and its descendants; the bare
  /// `...` pattern covers everything. A concrete label covers only itself.
  pub fn includes(&self, other: &BuildLabel) -> bool {
    if self.is_wildcard() {
      self.package.is_empty()
        || other.package == self.package
        || other
          .package
          .strip_prefix(&self.package)
          .is_some_and(|rest| rest.starts_with('/'))
    } else {
      self == other
    }
  }
}

impl fmt::Display for BuildLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "//{}:{}", self.package, self.name)
  }
}

/// Whether a source string should be parsed as a build label.
pub fn looks_like_label(s: &str) -> bool {
  s.starts_with("//") || s.starts_with(':')
}
