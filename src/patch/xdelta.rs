//! xdelta3 patch engine.
//!
//! Runs `xdelta3 -d -c -s <source> <patch>` and streams its stdout. Inputs
//! are staged in a private temp directory that is removed with the job.

use crate::patch::worker::{PatchEngine, WorkerFailure};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Output chunk size
pub const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct XdeltaEngine {
    program: PathBuf,
}

impl Default for XdeltaEngine {
    fn default() -> Self {
        Self::new("xdelta3")
    }
}

impl XdeltaEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

fn io_failure(context: &str, e: std::io::Error) -> WorkerFailure {
    WorkerFailure::new(format!("{}: {}", context, e), e.raw_os_error())
}

#[async_trait]
impl PatchEngine for XdeltaEngine {
    async fn apply(
        &self,
        source: Bytes,
        patch: Bytes,
        output: mpsc::Sender<Bytes>,
    ) -> Result<(), WorkerFailure> {
        let staging = tempfile::Builder::new()
            .prefix("quest-downgrade-")
            .tempdir()
            .map_err(|e| io_failure("cannot create staging directory", e))?;
        let source_path = staging.path().join("source.apk");
        let patch_path = staging.path().join("patch.xdelta");
        tokio::fs::write(&source_path, &source)
            .await
            .map_err(|e| io_failure("cannot stage source", e))?;
        tokio::fs::write(&patch_path, &patch)
            .await
            .map_err(|e| io_failure("cannot stage patch", e))?;

        debug!("Running {} on {}", self.program.display(), staging.path().display());
        let mut child = Command::new(&self.program)
            .arg("-d")
            .arg("-c")
            .arg("-s")
            .arg(&source_path)
            .arg(&patch_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_failure(&format!("cannot run {}", self.program.display()), e))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerFailure::new("child stdout unavailable", None))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        loop {
            let n = stdout
                .read_buf(&mut buf)
                .await
                .map_err(|e| io_failure("reading patch output", e))?;
            let eof = n == 0;
            if buf.len() >= CHUNK_SIZE || (eof && !buf.is_empty()) {
                let chunk = buf.split().freeze();
                if output.send(chunk).await.is_err() {
                    return Err(WorkerFailure::new("output receiver closed", None));
                }
                buf.reserve(CHUNK_SIZE);
            }
            if eof {
                break;
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| io_failure("waiting for xdelta3", e))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            let message = stderr.trim();
            warn!("xdelta3 failed ({}): {}", status, message);
            Err(WorkerFailure {
                message: Some(if message.is_empty() {
                    format!("xdelta3 exited with {}", status)
                } else {
                    message.to_string()
                }),
                code: status.code(),
            })
        }
    }
}
