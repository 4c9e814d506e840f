//! Composite cache keys.
//!
//! A key digests everything that can affect a target's outputs: input file
//! contents in declared order, the command, the pre-/post-build hook bytecode
//! digests, every dependency's outputs, and the output-affecting flags. The
//! cache treats keys as opaque bytes.

use std::fs;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::graph::BuildGraph;
use crate::input::BuildInput;
use crate::target::BuildTarget;

/// Width keys are collapsed to before hitting the filesystem.
pub const COLLAPSED_KEY_LEN: usize = 16;

#[derive(Serialize)]
struct OutputFlags {
  binary: bool,
  output_is_complete: bool,
  needs_transitive_deps: bool,
  containerise: bool,
}

/// Compute the cache key for a target against the current graph.
pub fn rule_key(graph: &BuildGraph, target: &BuildTarget, root: &Path) -> Result<Vec<u8>> {
  let mut hasher = Sha256::new();

  for source in &target.sources {
    hash_input(&mut hasher, source, root);
  }
  for (name, sources) in &target.named_sources {
    hasher.update(name.as_bytes());
    for source in sources {
      hash_input(&mut hasher, source, root);
    }
  }
  for tool in &target.tools {
    hash_input(&mut hasher, tool, root);
  }

  hasher.update(target.command.as_bytes());
  hasher.update(target.pre_build_hash.as_deref().unwrap_or_default());
  hasher.update(target.post_build_hash.as_deref().unwrap_or_default());

  // Dependency sets iterate in sorted label order, keeping this stable.
  for dep in &target.dependencies {
    hasher.update(dep.to_string().as_bytes());
    if let Some(dep_target) = graph.target(dep) {
      let out_dir = root.join(dep_target.out_dir());
      for out in dep_target.cache_artifacts() {
        hasher.update(out.as_bytes());
        hash_file(&mut hasher, &out_dir.join(out));
      }
    }
  }

  let flags = OutputFlags {
    binary: target.is_binary,
    output_is_complete: target.output_is_complete,
    needs_transitive_deps: target.needs_transitive_deps,
    containerise: target.containerise,
  };
  hasher.update(serde_json::to_vec(&flags).map_err(|e| crate::error::Error::Io(e.to_string()))?);

  Ok(hasher.finalize().to_vec())
}

fn hash_input(hasher: &mut Sha256, input: &BuildInput, root: &Path) {
  match input {
    BuildInput::File { .. } => {
      if let Some(path) = input.file_path() {
        hasher.update(path.as_bytes());
        hash_file(hasher, &root.join(path));
      }
    }
    // Label-valued inputs register a dependency, so their contents are
    // covered by the dependency-outputs walk.
    BuildInput::Target(label) => hasher.update(label.to_string().as_bytes()),
    BuildInput::TargetFile { label, file } => {
      hasher.update(label.to_string().as_bytes());
      hasher.update(file.as_bytes());
    }
    BuildInput::SubOutput { label, output } => {
      hasher.update(label.to_string().as_bytes());
      hasher.update(output.as_bytes());
    }
  }
}

fn hash_file(hasher: &mut Sha256, path: &Path) {
  match fs::read(path) {
    Ok(contents) => hasher.update(&contents),
    Err(_) => hasher.update(b"\0absent"),
  }
}

/// Collapse a digest to [`COLLAPSED_KEY_LEN`] bytes by XOR-folding.
pub fn collapse(digest: &[u8]) -> [u8; COLLAPSED_KEY_LEN] {
  let mut out = [0u8; COLLAPSED_KEY_LEN];
  for (i, byte) in digest.iter().enumerate() {
    out[i % COLLAPSED_KEY_LEN] ^= byte;
  }
  out
}

/// Encode a key as a fixed-length filesystem path segment.
///
/// The padded URL-safe alphabet matters: the external cache cleaner relies on
/// path segments having a constant length.
pub fn encode(key: &[u8]) -> String {
  use base64::Engine as _;
  base64::engine::general_purpose::URL_SAFE.encode(collapse(key))
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::label::BuildLabel;

  fn target_with_cmd(cmd: &str) -> BuildTarget {
    let mut t = BuildTarget::new(BuildLabel::new("p", "t"));
    t.command = cmd.to_string();
    t
  }

  #[test]
  fn keys_are_deterministic() {
    let tmp = TempDir::new().unwrap();
    let graph = BuildGraph::new();
    let target = target_with_cmd("echo hi");
    let a = rule_key(&graph, &target, tmp.path()).unwrap();
    let b = rule_key(&graph, &target, tmp.path()).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn command_changes_the_key() {
    let tmp = TempDir::new().unwrap();
    let graph = BuildGraph::new();
    let a = rule_key(&graph, &target_with_cmd("echo one"), tmp.path()).unwrap();
    let b = rule_key(&graph, &target_with_cmd("echo two"), tmp.path()).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn output_flags_change_the_key() {
    let tmp = TempDir::new().unwrap();
    let graph = BuildGraph::new();
    let plain = target_with_cmd("echo hi");
    let mut complete = target_with_cmd("echo hi");
    complete.output_is_complete = true;
    let a = rule_key(&graph, &plain, tmp.path()).unwrap();
    let b = rule_key(&graph, &complete, tmp.path()).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn source_contents_change_the_key() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("p")).unwrap();
    std::fs::write(tmp.path().join("p/in.txt"), "one").unwrap();

    let graph = BuildGraph::new();
    let mut target = target_with_cmd("cp $SRCS $OUT");
    target.sources.push(crate::input::BuildInput::File {
      package: "p".to_string(),
      file: "in.txt".to_string(),
    });

    let a = rule_key(&graph, &target, tmp.path()).unwrap();
    std::fs::write(tmp.path().join("p/in.txt"), "two").unwrap();
    let b = rule_key(&graph, &target, tmp.path()).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn encoded_keys_have_constant_length() {
    let short = encode(b"abc");
    let full = encode(&[0xab; 32]);
    assert_eq!(short.len(), full.len());
    // 16 bytes base64-encode to 24 characters with padding retained.
    assert_eq!(full.len(), 24);
  }
}
