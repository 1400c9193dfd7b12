//! Incremental output file.
//!
//! Chunks go to a hidden `.<name>.part` file next to the destination; only
//! `close` renames it into place, so a failed or abandoned job never leaves
//! a truncated APK behind.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// `downgraded_<version>.apk`, with path separators and other unsafe
/// characters in the version replaced
pub fn output_file_name(version: &str) -> String {
    let safe: String = version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("downgraded_{}.apk", safe)
}

#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    part_path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl FileSink {
    pub async fn create(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(name);
        let part_path = dir.join(format!(".{}.part", name));
        let file = File::create(&part_path).await?;
        debug!("Writing {}", part_path.display());
        Ok(Self {
            path,
            part_path,
            file: Some(file),
            bytes_written: 0,
        })
    }

    /// Final destination
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
            self.bytes_written += chunk.len() as u64;
        }
        Ok(())
    }

    /// Flush, sync and move the file into place
    pub async fn close(mut self) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&self.part_path, &self.path).await?;
        }
        debug!("Finalized {} ({} bytes)", self.path.display(), self.bytes_written);
        Ok(self.path.clone())
    }

    /// Discard everything written so far
    pub async fn abort(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            drop(file);
            match fs::remove_file(&self.part_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Discarded {}", self.part_path.display());
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.part_path) {
                warn!("Failed to remove {}: {}", self.part_path.display(), e);
            }
        }
    }
}
