//! Per-recording temporary working directory

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Owns `<temp_root>/recording_<id>/` and removes it when dropped.
///
/// Whichever path ends the session (completion, failure or a cancelled
/// future) drops the guard, so the directory is removed exactly once.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn create(temp_root: &Path, recording_id: i64) -> io::Result<Self> {
        let path = temp_root.join(format!("recording_{}", recording_id));
        fs::create_dir_all(&path)?;
        debug!("Created working directory {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the capture actor writes raw tracks into
    pub fn capture_dir(&self) -> PathBuf {
        self.path.join("capture")
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed working directory {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {:?}: {}", self.path, e),
        }
    }
}
