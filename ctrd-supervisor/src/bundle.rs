//! Container bundles and per-container work directories.
//!
//! A bundle is a caller-supplied OCI directory holding `rootfs/` and
//! `config.json`; the daemon only records its path. The work directory
//! `<root>/<id>` holds the shim's socket, log and pid files and is what
//! startup recovery scans for.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirBuilder};

use ctrd_shim::{LOG_NAME, SOCKET_NAME};

const DIR_MODE: u32 = 0o711;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub id: String,
    pub path: PathBuf,
    pub work_dir: PathBuf,
}

impl Bundle {
    /// Refer to a bundle without touching the filesystem.
    pub fn load(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.work_dir.join(SOCKET_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join(LOG_NAME)
    }

    /// Create the work directory. Fails if it already exists, which means
    /// another container owns it or a stale one was never cleaned up.
    pub async fn create_work_dir(&self) -> io::Result<()> {
        DirBuilder::new().mode(DIR_MODE).create(&self.work_dir).await
    }

    /// Remove the work directory, leaving the bundle itself in place. A
    /// missing directory is not an error.
    pub async fn remove_work_dir(&self) -> io::Result<()> {
        remove_all(&self.work_dir).await
    }
}

async fn remove_all(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}
