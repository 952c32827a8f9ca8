use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{FtpError, Result};

/// Confines a session's filesystem view to the subtree under its home
/// directory. `home` and `cwd` are always canonical absolute paths, and
/// `cwd` is always `home` or a descendant of it.
#[derive(Debug, Clone)]
pub struct PathJail {
  home: PathBuf,
  cwd: PathBuf,
}

impl PathJail {
  /// Creates the home directory if absent and canonicalizes it. The
  /// working directory starts at home.
  pub fn new(home: impl AsRef<Path>) -> Result<Self> {
    let home = home.as_ref();
    fs::create_dir_all(home)?;
    let home = home.canonicalize()?;
    Ok(Self {
      cwd: home.clone(),
      home,
    })
  }

  pub fn home(&self) -> &Path {
    &self.home
  }

  pub fn cwd(&self) -> &Path {
    &self.cwd
  }

  /// Changes the working directory. The target must already have passed
  /// through `resolve` and point at a directory.
  pub fn set_cwd(&mut self, dir: PathBuf) -> Result<()> {
    self.ensure_contained(&dir)?;
    self.cwd = dir;
    Ok(())
  }

  /// Resolves a client-supplied path. Leading `/` means relative to home,
  /// anything else relative to the working directory. The result is
  /// canonical (symlinks followed) and guaranteed to stay inside home.
  /// With `require_exists` the target itself must exist; without it only
  /// the parent must, so MKD and STOR can name a new leaf.
  pub fn resolve(&self, path: &str, require_exists: bool) -> Result<PathBuf> {
    let joined = if let Some(rest) = path.strip_prefix('/') {
      self.home.join(rest)
    } else {
      self.cwd.join(path)
    };

    let canonical = match joined.canonicalize() {
      Ok(c) => c,
      Err(e) if e.kind() == ErrorKind::NotFound && !require_exists => {
        let parent = joined
          .parent()
          .ok_or_else(|| FtpError::PermissionDenied(path.to_string()))?;
        let leaf = joined
          .file_name()
          .ok_or_else(|| FtpError::PermissionDenied(path.to_string()))?;
        let parent = parent
          .canonicalize()
          .map_err(|_| FtpError::NotFound(path.to_string()))?;
        parent.join(leaf)
      }
      Err(e) if e.kind() == ErrorKind::NotFound => {
        return Err(FtpError::NotFound(path.to_string()))
      }
      Err(_) => return Err(FtpError::PermissionDenied(path.to_string())),
    };

    self.ensure_contained(&canonical)?;
    Ok(canonical)
  }

  /// User-facing rendering of a jailed path: relative to home, `/`-rooted,
  /// forward slashes. The host filesystem prefix never leaks.
  pub fn ftp_path(&self, path: &Path) -> String {
    let rel = path.strip_prefix(&self.home).unwrap_or(Path::new(""));
    let mut out = String::from("/");
    let joined = rel
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/");
    out.push_str(&joined);
    out
  }

  // Component-wise prefix check, so /srv/alicex is not mistaken for a
  // child of /srv/alice.
  fn ensure_contained(&self, candidate: &Path) -> Result<()> {
    if candidate == self.home || candidate.starts_with(&self.home) {
      Ok(())
    } else {
      Err(FtpError::PermissionDenied(format!(
        "{} escapes the home directory",
        candidate.display()
      )))
    }
  }
}
