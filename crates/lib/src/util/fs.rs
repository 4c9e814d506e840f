//! Filesystem helpers shared by the cache.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Create a directory and any missing parents with mode 0755.
pub fn create_dirs(path: &Path) -> io::Result<()> {
  #[cfg(unix)]
  {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
  }
  #[cfg(not(unix))]
  {
    fs::create_dir_all(path)
  }
}

/// Copy a file or directory tree from `from` to `to`, setting `mode` on every
/// file. With `link` set, files are hardlinked instead of copied (the mode of
/// the shared inode is left as stored).
pub fn recursive_copy(from: &Path, to: &Path, mode: u32, link: bool) -> io::Result<()> {
  if from.is_dir() {
    for entry in WalkDir::new(from) {
      let entry = entry.map_err(io::Error::other)?;
      if !entry.file_type().is_file() {
        continue;
      }
      let rel = entry
        .path()
        .strip_prefix(from)
        .map_err(io::Error::other)?;
      copy_file(entry.path(), &to.join(rel), mode, link)?;
    }
    Ok(())
  } else {
    copy_file(from, to, mode, link)
  }
}

fn copy_file(from: &Path, to: &Path, mode: u32, link: bool) -> io::Result<()> {
  if let Some(parent) = to.parent() {
    create_dirs(parent)?;
  }
  if link {
    fs::hard_link(from, to)
  } else {
    fs::copy(from, to)?;
    set_mode(to, mode)
  }
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
  }
  #[cfg(not(unix))]
  {
    let _ = (path, mode);
    Ok(())
  }
}
