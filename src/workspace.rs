use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{debug, warn};

const WORKSPACE_PREFIX: &str = "yt-dlp-";

#[derive(Debug, thiserror::Error)]
#[error("could not create temporary workspace: {0}")]
pub struct WorkspaceError(#[from] io::Error);

/// Per-request scratch directory holding the file produced by a download.
///
/// The directory and its files are removed by [`Workspace::release`], or by
/// `Drop` when the handle goes away without an explicit release. Either way
/// removal runs exactly once.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn acquire(root: &Path) -> Result<Self, WorkspaceError> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        debug!("Workspace created at {:?}", path);

        Ok(Self {
            dir: Some(dir),
            path,
            created_at: Utc::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// yt-dlp output template naming the file after the source title.
    pub fn output_template(&self) -> String {
        format!("{}/%(title)s.%(ext)s", self.path.to_string_lossy())
    }

    /// Regular files directly inside the workspace, sorted by name.
    pub async fn files(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    pub fn release(mut self) {
        self.remove();
    }

    /// Runs the removal on the blocking pool and waits for it.
    pub async fn release_async(self) {
        if let Err(error) = tokio::task::spawn_blocking(move || self.release()).await {
            warn!("Workspace release task failed: {error}");
        }
    }

    /// Hands the removal to the blocking pool without waiting. Outside a
    /// runtime the removal runs inline.
    pub fn release_in_background(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || self.release());
            }
            Err(_) => self.release(),
        }
    }

    fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        match std::fs::read_dir(dir.path()) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                        continue;
                    }
                    let path = entry.path();
                    if let Err(error) = std::fs::remove_file(&path)
                        && error.kind() != ErrorKind::NotFound
                    {
                        warn!("Could not remove workspace file {:?}: {error}", path);
                    }
                }
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not list workspace {:?}: {error}", self.path),
        }

        // close() falls back to a recursive removal, so stray subdirectories
        // left by the extractor go too.
        if let Err(error) = dir.close()
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove workspace {:?}: {error}", self.path);
        } else {
            debug!(
                "Workspace {:?} released after {}ms",
                self.path,
                (Utc::now() - self.created_at).num_milliseconds()
            );
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}
