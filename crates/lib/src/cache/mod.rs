//! Directory-rooted, content-addressed artifact cache.
//!
//! Layout: `<root>/<package>/<target-name>/<base64url key>/...outputs`.
//! Stores are real copies; retrieval hardlinks back out. Concurrent processes
//! need no locking: key directories are unique and links are atomic at the
//! inode level. Every operation is best-effort, so failures are logged and
//! swallowed, and a miss is not an error.

pub mod key;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::target::BuildTarget;
use crate::util::fs::{create_dirs, recursive_copy};

pub struct DirCache {
  dir: PathBuf,
  root: PathBuf,
}

impl DirCache {
  /// Create the cache, making its root directory and firing off the external
  /// cleaner process if one is configured.
  pub fn new(config: &CacheConfig, repo_root: &Path) -> Result<Self> {
    let dir = if Path::new(&config.dir).is_absolute() {
      PathBuf::from(&config.dir)
    } else {
      repo_root.join(&config.dir)
    };
    create_dirs(&dir)?;

    if !config.cleaner.is_empty() {
      let cleaner = config.cleaner.clone();
      let cache_dir = dir.clone();
      let high = config.high_water_mark.clone();
      let low = config.low_water_mark.clone();
      std::thread::spawn(move || {
        info!(cleaner = %cleaner, dir = %cache_dir.display(), "running cache cleaner");
        let output = Command::new(&cleaner)
          .arg("--dir")
          .arg(&cache_dir)
          .arg("--high_water_mark")
          .arg(&high)
          .arg("--low_water_mark")
          .arg(&low)
          .output();
        match output {
          Ok(out) if out.status.success() => debug!(cleaner = %cleaner, "cache cleaner finished"),
          Ok(out) => error!(
            status = %out.status,
            output = %String::from_utf8_lossy(&out.stderr),
            "cache cleaner error"
          ),
          Err(err) => error!(cleaner = %cleaner, %err, "failed to run cache cleaner"),
        }
      });
    }

    Ok(Self {
      dir,
      root: repo_root.to_path_buf(),
    })
  }

  // Padded encoding keeps path segments a constant length for the cleaner.
  fn key_path(&self, target: &BuildTarget, cache_key: &[u8]) -> PathBuf {
    self
      .dir
      .join(&target.label.package)
      .join(&target.label.name)
      .join(key::encode(cache_key))
  }

  /// Store every artifact of `target` under the key, replacing whatever was
  /// there before.
  pub fn store(&self, target: &BuildTarget, cache_key: &[u8]) {
    let cache_dir = self.key_path(target, cache_key);
    if cache_dir.exists()
      && let Err(err) = fs::remove_dir_all(&cache_dir)
    {
      warn!(dir = %cache_dir.display(), %err, "failed to remove existing cache directory");
      return;
    }
    for out in target.cache_artifacts() {
      self.store_extra(target, cache_key, out);
    }
  }

  /// Store a single artifact, used for outputs discovered after the build.
  pub fn store_extra(&self, target: &BuildTarget, cache_key: &[u8], out: &str) {
    let cache_dir = self.key_path(target, cache_key);
    debug!(target = %target.label, out, "storing in dir cache");
    let out_file = self.root.join(target.out_dir()).join(out);
    let cached_file = cache_dir.join(out);
    if cached_file.exists()
      && let Err(err) = fs::remove_dir_all(&cached_file).or_else(|_| fs::remove_file(&cached_file))
    {
      warn!(file = %cached_file.display(), %err, "failed to remove existing cached file");
      return;
    }
    if let Err(err) = create_dirs(cached_file.parent().unwrap_or(&cache_dir)) {
      warn!(dir = %cache_dir.display(), %err, "failed to create cache directory");
      return;
    }
    // Cannot hardlink files into the cache, must copy them for real.
    if let Err(err) = recursive_copy(&out_file, &cached_file, file_mode(target), false) {
      warn!(file = %cached_file.display(), %err, "failed to store cache file");
    }
  }

  /// Link every artifact of `target` back into its out-dir. True only if the
  /// key directory exists and every artifact was restored.
  pub fn retrieve(&self, target: &BuildTarget, cache_key: &[u8]) -> bool {
    let cache_dir = self.key_path(target, cache_key);
    if !cache_dir.exists() {
      debug!(target = %target.label, dir = %cache_dir.display(), "not in dir cache");
      return false;
    }
    target
      .cache_artifacts()
      .all(|out| self.retrieve_extra(target, cache_key, out))
  }

  /// Link a single artifact back into the out-dir.
  pub fn retrieve_extra(&self, target: &BuildTarget, cache_key: &[u8], out: &str) -> bool {
    let cached_out = self.key_path(target, cache_key).join(out);
    if !cached_out.exists() {
      debug!(target = %target.label, file = %cached_out.display(), "not in dir cache");
      return false;
    }
    let real_out = self.root.join(target.out_dir()).join(out);
    if let Some(parent) = real_out.parent()
      && let Err(err) = create_dirs(parent)
    {
      warn!(dir = %parent.display(), %err, "failed to create output directory");
      return false;
    }
    // Unlink the existing output first: replacing a still-running binary
    // through the link would hit ETXTBSY.
    if real_out.exists()
      && let Err(err) = fs::remove_dir_all(&real_out).or_else(|_| fs::remove_file(&real_out))
    {
      warn!(file = %real_out.display(), %err, "failed to unlink existing output");
      return false;
    }
    if let Err(err) = recursive_copy(&cached_out, &real_out, file_mode(target), true) {
      warn!(
        from = %cached_out.display(),
        to = %real_out.display(),
        %err,
        "failed to link cached file to output"
      );
      return false;
    }
    debug!(target = %target.label, file = %cached_out.display(), "retrieved from dir cache");
    true
  }

  /// Drop every cached artifact for a target, across all keys.
  pub fn clean(&self, target: &BuildTarget) {
    let dir = self.dir.join(&target.label.package).join(&target.label.name);
    if dir.exists()
      && let Err(err) = fs::remove_dir_all(&dir)
    {
      warn!(target = %target.label, %err, "failed to remove cached artifacts");
    }
  }
}

fn file_mode(target: &BuildTarget) -> u32 {
  if target.is_binary { 0o555 } else { 0o444 }
}
