//! Patch pipeline.
//!
//! One job: resolve the installed app, pick the first compatible manifest
//! record, fetch its patch and the installed APK, then stream the worker's
//! output into a [`FileSink`]. The sink is only opened when the first chunk
//! arrives and is finalized or discarded by the worker's terminal message.

use crate::error::{BridgeError, Result};
use crate::manifest::VersionRecord;
use crate::patch::fetch::PatchFetcher;
use crate::patch::sink::{output_file_name, FileSink};
use crate::patch::worker::{
    PatchEngine, PatchWorker, WorkerCommand, WorkerFailure, WorkerMessage,
};
use crate::resolver::{InstalledApp, VersionResolver};
use crate::services::shell::RemoteShell;
use crate::services::sync::RemoteFiles;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where pushed APKs are staged before `pm install`
pub const REMOTE_STAGING_DIR: &str = "/data/local/tmp";

/// Inputs for one patch attempt
#[derive(Debug, Clone)]
pub struct PatchJob {
    pub source: Bytes,
    pub patch: Bytes,
    pub output_name: String,
}

impl PatchJob {
    /// Rejects empty inputs, reporting which of them is unusable
    pub fn new(source: Bytes, patch: Bytes, output_name: impl Into<String>) -> Result<Self> {
        if source.is_empty() || patch.is_empty() {
            return Err(BridgeError::InvalidInput {
                source_valid: !source.is_empty(),
                patch_valid: !patch.is_empty(),
            });
        }
        Ok(Self {
            source,
            patch,
            output_name: output_name.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub record: VersionRecord,
    pub installed: InstalledApp,
    pub output: PathBuf,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Nothing in the manifest matches; `installed` is `None` when the app
    /// could not be inspected at all
    NoCompatibleDowngrade { installed: Option<InstalledApp> },
    Patched(PatchReport),
}

/// Clears the running flag however the job ends
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BridgeError::PatchInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PatchPipeline {
    resolver: Arc<VersionResolver>,
    files: Arc<dyn RemoteFiles>,
    fetcher: Arc<dyn PatchFetcher>,
    engine: Arc<dyn PatchEngine>,
    output_dir: PathBuf,
    running: AtomicBool,
}

impl std::fmt::Debug for PatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchPipeline")
            .field("resolver", &self.resolver)
            .field("output_dir", &self.output_dir)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PatchPipeline {
    pub fn new(
        resolver: Arc<VersionResolver>,
        files: Arc<dyn RemoteFiles>,
        fetcher: Arc<dyn PatchFetcher>,
        engine: Arc<dyn PatchEngine>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resolver,
            files,
            fetcher,
            engine,
            output_dir: output_dir.into(),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn run(&self) -> Result<PatchOutcome> {
        let _running = RunningGuard::acquire(&self.running)?;

        let Some(installed) = self.resolver.installed_app().await? else {
            info!("{} is not installed", self.resolver.app_id());
            return Ok(PatchOutcome::NoCompatibleDowngrade { installed: None });
        };

        let Some(record) = self.resolver.candidates_for(&installed).into_iter().next() else {
            info!(
                "No compatible downgrade for {} ({} bytes)",
                installed.version, installed.byte_size
            );
            return Ok(PatchOutcome::NoCompatibleDowngrade {
                installed: Some(installed),
            });
        };

        info!("Downloading patch for {}", record.source_version);
        let patch = self.fetcher.fetch(&record.download).await?;

        info!("Pulling {}", installed.apk_path);
        let source = self.files.read_file(&installed.apk_path).await?;

        let job = PatchJob::new(source, patch, output_file_name(&installed.version))?;
        let (output, bytes_written) = self.run_job(job).await?;
        info!("Wrote {} ({} bytes)", output.display(), bytes_written);

        Ok(PatchOutcome::Patched(PatchReport {
            record,
            installed,
            output,
            bytes_written,
        }))
    }

    /// Drive one worker to completion, persisting its chunks in order
    pub async fn run_job(&self, job: PatchJob) -> Result<(PathBuf, u64)> {
        let PatchJob {
            source,
            patch,
            output_name,
        } = job;

        let mut worker = PatchWorker::spawn(self.engine.clone());
        if !worker.post(WorkerCommand::Start { source, patch }).await {
            return Err(worker_error(WorkerFailure::new(
                "worker exited before start",
                None,
            )));
        }

        let mut sink: Option<FileSink> = None;
        let result = loop {
            match worker.next_message().await {
                Some(WorkerMessage::Chunk(bytes)) => {
                    if sink.is_none() {
                        sink = Some(FileSink::create(&self.output_dir, &output_name).await?);
                    }
                    if let Some(writer) = sink.as_mut() {
                        writer.write(&bytes).await?;
                    }
                }
                Some(WorkerMessage::Done) => break Ok(()),
                Some(WorkerMessage::Failed(failure)) => break Err(failure),
                None => {
                    break Err(WorkerFailure::new(
                        "worker stopped without a result",
                        None,
                    ))
                }
            }
        };
        // Nothing after the terminal message matters
        worker.cancel();

        match (result, sink) {
            (Ok(()), Some(sink)) => {
                let bytes_written = sink.bytes_written();
                let path = sink.close().await?;
                Ok((path, bytes_written))
            }
            (Ok(()), None) => Err(worker_error(WorkerFailure::new(
                "patch produced no output",
                None,
            ))),
            (Err(failure), sink) => {
                if let Some(sink) = sink {
                    if let Err(e) = sink.abort().await {
                        warn!("Failed to discard partial output: {}", e);
                    }
                }
                Err(worker_error(failure))
            }
        }
    }
}

fn worker_error(failure: WorkerFailure) -> BridgeError {
    BridgeError::PatchWorker {
        message: failure.message,
        code: failure.code,
    }
}

/// Push a local APK to the device and install it over the current one
pub async fn install_apk(
    files: &dyn RemoteFiles,
    shell: &dyn RemoteShell,
    apk: &Path,
) -> Result<()> {
    let name = apk
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BridgeError::Config(format!("not an APK file: {}", apk.display())))?;
    let remote = format!("{}/{}", REMOTE_STAGING_DIR, name);

    let content = Bytes::from(tokio::fs::read(apk).await?);
    info!("Pushing {} to {}", apk.display(), remote);
    files.write_file(&remote, content).await?;

    let command = format!("pm install -r -d {}", remote);
    let output = shell.run_command(&command).await?;
    if let Err(e) = shell.run_command(&format!("rm -f {}", remote)).await {
        debug!("Could not remove {}: {}", remote, e);
    }

    if output.success() && output.stdout.contains("Success") {
        Ok(())
    } else {
        let reason = [output.stdout.trim(), output.stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        Err(BridgeError::CommandExecution {
            command,
            message: if reason.is_empty() {
                format!("exit code {:?}", output.exit_code)
            } else {
                reason
            },
        })
    }
}
