//! Per-session scratch directories.
//!
//! Registered and averaged volumes live in a [`WorkDir`] named after the
//! session (`sub-01_ses-A_eta_temp_XXXXXX`). It is removed when dropped
//! unless debug retention was requested. Every live work dir is also listed
//! in an [`ActiveWorkdirs`] registry so an interrupt handler can delete them
//! before the process exits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::TempDir;

use crate::bids::Session;
use crate::error::Result;

/// Shared list of work dirs currently in use.
#[derive(Debug, Clone, Default)]
pub struct ActiveWorkdirs {
    inner: Arc<Mutex<Vec<PathBuf>>>,
}

impl ActiveWorkdirs {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, path: &Path) {
        self.entries().push(path.to_path_buf());
    }

    fn release(&self, path: &Path) {
        self.entries().retain(|p| p != path);
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries().clone()
    }

    /// Delete every registered directory. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut entries = self.entries();
        let mut removed = 0;
        for path in entries.drain(..) {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Could not remove {}: {e}", path.display()),
            }
        }
        removed
    }
}

/// Scratch directory for one session's intermediate volumes.
#[derive(Debug)]
pub struct WorkDir {
    dir: Option<TempDir>,
    path: PathBuf,
    keep: bool,
    registry: ActiveWorkdirs,
}

impl WorkDir {
    /// Create a fresh work dir for `session` under `base`.
    pub fn create(
        base: &Path,
        session: &Session,
        keep: bool,
        registry: &ActiveWorkdirs,
    ) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_eta_temp_", session.label()))
            .tempdir_in(base)?;
        let path = dir.path().to_path_buf();
        registry.insert(&path);
        log::debug!("Work dir for {session}: {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
            keep,
            registry: registry.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the directory: delete it, or keep it on disk when debug
    /// retention is on. Returns the kept path, if any.
    pub fn finish(mut self) -> Result<Option<PathBuf>> {
        self.registry.release(&self.path);
        let Some(dir) = self.dir.take() else {
            return Ok(None);
        };
        if self.keep {
            let kept = dir.keep();
            log::info!("Keeping intermediate volumes in {}", kept.display());
            Ok(Some(kept))
        } else {
            dir.close()?;
            Ok(None)
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        self.registry.release(&self.path);
        if self.keep {
            if let Some(dir) = self.dir.take() {
                let _ = dir.keep();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("01", Some("A"))
    }

    #[test]
    fn test_workdir_named_after_session_and_removed() {
        let base = tempfile::tempdir().unwrap();
        let registry = ActiveWorkdirs::new();
        let wd = WorkDir::create(base.path(), &session(), false, &registry).unwrap();
        let path = wd.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sub-01_ses-A_eta_temp_"), "{name}");
        assert!(path.is_dir());
        assert_eq!(registry.paths(), vec![path.clone()]);

        assert_eq!(wd.finish().unwrap(), None);
        assert!(!path.exists());
        assert!(registry.paths().is_empty());
    }

    #[test]
    fn test_workdir_kept_in_debug() {
        let base = tempfile::tempdir().unwrap();
        let registry = ActiveWorkdirs::new();
        let wd = WorkDir::create(base.path(), &session(), true, &registry).unwrap();
        std::fs::write(wd.path().join("AP_mean.nii.gz"), b"x").unwrap();
        let kept = wd.finish().unwrap().unwrap();
        assert!(kept.join("AP_mean.nii.gz").is_file());
    }

    #[test]
    fn test_dropped_workdir_is_removed() {
        let base = tempfile::tempdir().unwrap();
        let registry = ActiveWorkdirs::new();
        let path = {
            let wd = WorkDir::create(base.path(), &session(), false, &registry).unwrap();
            wd.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(registry.paths().is_empty());
    }

    #[test]
    fn test_purge_removes_live_dirs() {
        let base = tempfile::tempdir().unwrap();
        let registry = ActiveWorkdirs::new();
        let a = WorkDir::create(base.path(), &session(), true, &registry).unwrap();
        let b = WorkDir::create(base.path(), &Session::new("02", None), true, &registry).unwrap();
        let (pa, pb) = (a.path().to_path_buf(), b.path().to_path_buf());

        assert_eq!(registry.purge(), 2);
        assert!(!pa.exists() && !pb.exists());
        assert!(registry.paths().is_empty());
    }
}
