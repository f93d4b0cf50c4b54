//! Writing capture artifacts to disk

use crate::capture::CaptureResult;
use crate::error::{CaptureError, Result};
use std::path::{Path, PathBuf};

/// Paths of the three files produced for one capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub headers: PathBuf,
    pub html: PathBuf,
    pub screenshot: PathBuf,
}

/// Writes `{prefix}_headers.json`, `{prefix}_page.html` and
/// `{prefix}_screenshot.png` into one directory
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, prefix: &str) -> ArtifactPaths {
        ArtifactPaths {
            headers: self.dir.join(format!("{}_headers.json", prefix)),
            html: self.dir.join(format!("{}_page.html", prefix)),
            screenshot: self.dir.join(format!("{}_screenshot.png", prefix)),
        }
    }

    /// Write all three artifacts
    ///
    /// Every write is attempted even when another one fails; the first failure
    /// is returned.
    pub async fn write(&self, result: &CaptureResult, prefix: &str) -> Result<ArtifactPaths> {
        self.ensure_dir().await?;

        let paths = self.paths(prefix);
        let headers_json = serde_json::to_vec_pretty(&[&result.matched_response])
            .map_err(|e| CaptureError::Other(format!("Failed to serialize headers: {}", e)))?;

        let (headers, html, screenshot) = tokio::join!(
            write_file(&paths.headers, &headers_json),
            write_file(&paths.html, result.html.as_bytes()),
            write_file(&paths.screenshot, &result.screenshot),
        );
        headers?;
        html?;
        screenshot?;

        log::info!("Artifacts written to {}", self.dir.display());
        Ok(paths)
    }

    async fn ensure_dir(&self) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);

        builder
            .create(&self.dir)
            .await
            .map_err(|source| CaptureError::WriteFailed {
                path: self.dir.clone(),
                source,
            })
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(path, contents).await.map_err(|source| {
        log::error!("Failed to write {}: {}", path.display(), source);
        CaptureError::WriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })
}
