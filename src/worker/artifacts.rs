//! Per-run artifact directories and their public URLs.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Directory holding everything one task run leaves behind: the teed
/// stdout, stderr, and the worker's own notes about the run.
pub struct ArtifactsRoot {
    path: PathBuf,
    url: String,
}

impl ArtifactsRoot {
    /// Creates a fresh `run-<timestamp>-<pid>` directory under `root`.
    ///
    /// The URL points into `public_base_url` when the artifacts root is
    /// served somewhere; otherwise it degrades to a `file://` URL so
    /// status records always carry a usable location.
    pub fn create(root: &Path, public_base_url: Option<&str>) -> io::Result<Self> {
        let run_id = format!(
            "run-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S%6f"),
            std::process::id()
        );
        let path = root.join(&run_id);
        std::fs::create_dir_all(&path)?;
        let url = match public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), run_id),
            None => format!("file://{}", path.display()),
        };
        Ok(Self { path, url })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
