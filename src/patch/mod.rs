//! Streaming patch application.

pub mod fetch;
pub mod pipeline;
pub mod sink;
pub mod worker;
pub mod xdelta;

pub use fetch::{http_client, HttpFetcher, PatchFetcher};
pub use pipeline::{install_apk, PatchJob, PatchOutcome, PatchPipeline, PatchReport};
pub use sink::{output_file_name, FileSink};
pub use worker::{PatchEngine, PatchWorker, WorkerCommand, WorkerFailure, WorkerMessage};
pub use xdelta::XdeltaEngine;
