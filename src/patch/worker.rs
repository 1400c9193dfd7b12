//! Patch worker.
//!
//! The worker is a task that owns its inputs and talks to the coordinator
//! only through ordered channels:
//!
//! ```text
//! coordinator --Start{source, patch}--> worker
//! coordinator <--Chunk* then Done|Failed-- worker
//! ```
//!
//! Exactly one terminal message ends every job.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Chunks buffered between the engine and the coordinator
pub const WORKER_CHANNEL_SIZE: usize = 16;

#[derive(Debug)]
pub enum WorkerCommand {
    Start { source: Bytes, patch: Bytes },
}

/// Detail reported by a failing engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerFailure {
    pub message: Option<String>,
    pub code: Option<i32>,
}

impl WorkerFailure {
    pub fn new(message: impl Into<String>, code: Option<i32>) -> Self {
        Self {
            message: Some(message.into()),
            code,
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, self.code) {
            (Some(m), Some(c)) => write!(f, "{} (code {})", m, c),
            (Some(m), None) => f.write_str(m),
            (None, Some(c)) => write!(f, "code {}", c),
            (None, None) => f.write_str("unknown failure"),
        }
    }
}

#[derive(Debug)]
pub enum WorkerMessage {
    /// Next piece of the patched output
    Chunk(Bytes),
    Done,
    Failed(WorkerFailure),
}

impl WorkerMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// Applies a binary patch, emitting the result as ordered chunks
#[async_trait]
pub trait PatchEngine: Send + Sync {
    async fn apply(
        &self,
        source: Bytes,
        patch: Bytes,
        output: mpsc::Sender<Bytes>,
    ) -> Result<(), WorkerFailure>;
}

/// Handle to one running worker task
pub struct PatchWorker {
    commands: mpsc::Sender<WorkerCommand>,
    messages: mpsc::Receiver<WorkerMessage>,
    task: JoinHandle<()>,
}

impl fmt::Debug for PatchWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchWorker")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl PatchWorker {
    pub fn spawn(engine: Arc<dyn PatchEngine>) -> Self {
        let (command_tx, mut command_rx) = mpsc::channel::<WorkerCommand>(1);
        let (message_tx, message_rx) = mpsc::channel::<WorkerMessage>(WORKER_CHANNEL_SIZE);

        let task = tokio::spawn(async move {
            let Some(WorkerCommand::Start { source, patch }) = command_rx.recv().await else {
                return;
            };
            debug!(
                "Worker started: source {} bytes, patch {} bytes",
                source.len(),
                patch.len()
            );

            let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(WORKER_CHANNEL_SIZE);
            let forward_tx = message_tx.clone();
            let forward = async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    trace!("Worker chunk {} bytes", chunk.len());
                    if forward_tx.send(WorkerMessage::Chunk(chunk)).await.is_err() {
                        break;
                    }
                }
            };

            let (result, ()) = tokio::join!(engine.apply(source, patch, chunk_tx), forward);

            let terminal = match result {
                Ok(()) => WorkerMessage::Done,
                Err(failure) => WorkerMessage::Failed(failure),
            };
            let _ = message_tx.send(terminal).await;
        });

        Self {
            commands: command_tx,
            messages: message_rx,
            task,
        }
    }

    pub async fn post(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Next message in send order; `None` once the worker is gone
    pub async fn next_message(&mut self) -> Option<WorkerMessage> {
        self.messages.recv().await
    }

    /// Stop the worker and whatever it is computing
    pub fn cancel(&self) {
        if !self.task.is_finished() {
            debug!("Cancelling patch worker");
        }
        self.task.abort();
    }
}

impl Drop for PatchWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Scripted {
        chunks: Vec<&'static str>,
        outcome: Result<(), WorkerFailure>,
    }

    #[async_trait]
    impl PatchEngine for Scripted {
        async fn apply(
            &self,
            _source: Bytes,
            _patch: Bytes,
            output: mpsc::Sender<Bytes>,
        ) -> Result<(), WorkerFailure> {
            for chunk in self.chunks.iter().copied() {
                let _ = output.send(Bytes::from_static(chunk.as_bytes())).await;
            }
            self.outcome.clone()
        }
    }

    struct Stuck {
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PatchEngine for Stuck {
        async fn apply(
            &self,
            _source: Bytes,
            _patch: Bytes,
            output: mpsc::Sender<Bytes>,
        ) -> Result<(), WorkerFailure> {
            let _guard = SetOnDrop(self.dropped.clone());
            let _ = output.send(Bytes::from_static(b"first")).await;
            pending::<()>().await;
            Ok(())
        }
    }

    fn start() -> WorkerCommand {
        WorkerCommand::Start {
            source: Bytes::from_static(b"src"),
            patch: Bytes::from_static(b"patch"),
        }
    }

    async fn collect(worker: &mut PatchWorker) -> Vec<WorkerMessage> {
        let mut out = Vec::new();
        while let Some(message) = worker.next_message().await {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn test_chunks_in_order_then_done() {
        let mut worker = PatchWorker::spawn(Arc::new(Scripted {
            chunks: vec!["b1", "b2", "b3"],
            outcome: Ok(()),
        }));
        assert!(worker.post(start()).await);

        let messages = collect(&mut worker).await;
        assert_eq!(messages.len(), 4);
        let data: Vec<u8> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Chunk(c) => Some(c.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(data, b"b1b2b3");
        assert!(matches!(messages[3], WorkerMessage::Done));
    }

    #[tokio::test]
    async fn test_failure_is_single_terminal_message() {
        let mut worker = PatchWorker::spawn(Arc::new(Scripted {
            chunks: vec!["partial"],
            outcome: Err(WorkerFailure::new("bad checksum", Some(-17712))),
        }));
        worker.post(start()).await;

        let messages = collect(&mut worker).await;
        assert_eq!(messages.iter().filter(|m| m.is_terminal()).count(), 1);
        match messages.last() {
            Some(WorkerMessage::Failed(failure)) => {
                assert_eq!(failure.to_string(), "bad checksum (code -17712)");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_engine() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut worker = PatchWorker::spawn(Arc::new(Stuck {
            dropped: dropped.clone(),
        }));
        worker.post(start()).await;
        assert!(matches!(
            worker.next_message().await,
            Some(WorkerMessage::Chunk(_))
        ));

        worker.cancel();
        assert!(worker.next_message().await.is_none());
        assert!(dropped.load(Ordering::SeqCst));
    }
}
