//! On-disk layout of a site directory.
//!
//! ```text
//! <site>/site.db            authoritative ledger, config, file index
//! <site>/counters-<w>.db    per-worker derivation counters
//! <site>/sessions/<id>.db   one ledger per visitor session
//! <site>/files/...          published content, addressed by storage path
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SitePaths {
    root: PathBuf,
}

impl SitePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SitePaths { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn site_db(&self) -> PathBuf {
        self.root.join("site.db")
    }

    pub fn counters_db(&self, worker_id: u32) -> PathBuf {
        self.root.join(format!("counters-{worker_id}.db"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_db(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.db"))
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn file(&self, storage_path: &str) -> PathBuf {
        self.files_dir().join(storage_path)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.files_dir())
    }
}
