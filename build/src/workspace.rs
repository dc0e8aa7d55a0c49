//! Allocation and teardown of the per-request build directory.
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

/// Prefix of all workspace directory names below the scratch root.
const WORKSPACE_PREFIX: &str = "compile-";

/// An isolated, uniquely named directory a single request builds in.
///
/// The directory tree is removed when the [Workspace] is dropped, which
/// covers every exit path of a request, including panics. Failures to remove
/// it are logged, never surfaced.
#[derive(Debug)]
pub struct Workspace {
    /// Canonicalized path of the directory.
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Workspace {
    /// Allocates a new workspace below `scratch_root`, creating the scratch
    /// root first if it doesn't exist yet.
    #[instrument(err)]
    pub fn create(scratch_root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(scratch_root)?;

        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(scratch_root)?;

        // All containment checks compare against the canonical path.
        let path = dir.path().canonicalize()?;
        debug!(workspace.path=?path, "allocated workspace");

        Ok(Self {
            path,
            dir: Some(dir),
        })
    }

    /// Removes workspaces below `scratch_root` left behind by an earlier
    /// process that didn't get to clean up, and returns how many there were.
    /// Must only be called while no requests are handled.
    #[instrument(err)]
    pub fn remove_stale(scratch_root: &Path) -> std::io::Result<usize> {
        let entries = match std::fs::read_dir(scratch_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX)
                || !entry.file_type()?.is_dir()
            {
                continue;
            }

            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(err=%e, path=?entry.path(), "failed to remove stale workspace"),
            }
        }

        if removed > 0 {
            info!(removed, "removed stale workspaces");
        }
        Ok(removed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the workspace now, instead of waiting for it to be dropped.
    pub fn destroy(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => debug!(workspace.path=?self.path, "removed workspace"),
                Err(e) => warn!(err=%e, workspace.path=?self.path, "failed to remove workspace"),
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}
