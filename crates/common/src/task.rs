//! Per-chunk transfer state machine
//!
//! ```text
//!             settle()             adapter ok
//!   (new) ---------------> downloading ---------> done
//!                           |     ^   \
//!                   pause() |     |    \ adapter error / stop()
//!                           v     |     v
//!                           pause-     failed
//!                              settle()
//! ```
//!
//! A [`Task`] drives one [`TaskAdapter`] (one transport, one composable).
//! The adapter runs on its own tokio task and watches a control signal;
//! pausing or stopping flips the signal and waits for the adapter to
//! acknowledge by returning [`TransferError::Interrupted`].

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::index::Composable;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The adapter stopped because it was asked to pause or stop
    #[error("transfer interrupted")]
    Interrupted,
    #[error("transfer canceled")]
    Canceled,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("transfer i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("entry not found in archive: {0}")]
    EntryNotFound(String),
    #[error("transfer timed out")]
    Timeout,
    #[error("transfer aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Downloading,
    Pause,
    Failed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Run,
    Pause,
    Stop,
}

/// Transferred-byte counter shared between a task, its adapter
///  and whoever reports aggregate progress
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicU64>);

impl Progress {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Only used when a transfer has to restart from zero
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Everything an adapter needs for one attempt
#[derive(Debug)]
pub struct TransferContext {
    pub composable: Composable,
    /// Where the chunk is written (the local store entry)
    pub output: PathBuf,
    /// Bytes already durable in `output`; adapters resume from here
    pub progress: Progress,
    signal: watch::Receiver<Signal>,
}

impl TransferContext {
    pub fn new(
        composable: Composable,
        output: PathBuf,
        progress: Progress,
        signal: watch::Receiver<Signal>,
    ) -> Self {
        Self {
            composable,
            output,
            progress,
            signal,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        *self.signal.borrow() != Signal::Run
    }

    /// Resolves once the task is asked to pause or stop. Meant to be
    ///  raced against transport I/O with `tokio::select!`.
    pub async fn interrupted(&mut self) {
        loop {
            if *self.signal.borrow_and_update() != Signal::Run {
                return;
            }
            if self.signal.changed().await.is_err() {
                // the owning task is gone
                return;
            }
        }
    }
}

/// One transport's way of moving one chunk.
///
/// `start` writes the chunk to `ctx.output`, continuing from
///  `ctx.progress` bytes when the transport can. It must return
///  [`TransferError::Interrupted`] soon after [`TransferContext::interrupted`]
///  resolves, leaving everything already flushed on disk and
///  `ctx.progress` equal to the durable byte count. That return is the
///  pause / stop acknowledgement.
#[async_trait]
pub trait TaskAdapter: Send + Sync + fmt::Debug {
    async fn start(&self, ctx: &mut TransferContext) -> Result<(), TransferError>;
}

pub struct Task {
    source: usize,
    composable: Composable,
    output: PathBuf,
    adapter: Arc<dyn TaskAdapter>,
    status: TaskStatus,
    error: Option<TransferError>,
    progress: Progress,
    signal: watch::Sender<Signal>,
    running: Option<Running>,
}

/// The spawned adapter; aborted if the task goes away mid-transfer
struct Running(JoinHandle<Result<(), TransferError>>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("source", &self.source)
            .field("hash", &self.composable.hash)
            .field("status", &self.status)
            .field("progress", &self.progress.get())
            .finish()
    }
}

impl Task {
    /// `source` identifies the source the adapter came from,
    ///  the task itself never looks at it
    pub fn new(
        source: usize,
        composable: Composable,
        output: PathBuf,
        adapter: Arc<dyn TaskAdapter>,
    ) -> Self {
        let (signal, _) = watch::channel(Signal::Run);
        Self {
            source,
            composable,
            output,
            adapter,
            status: TaskStatus::Downloading,
            error: None,
            progress: Progress::default(),
            signal,
            running: None,
        }
    }

    pub fn source(&self) -> usize {
        self.source
    }

    pub fn composable(&self) -> &Composable {
        &self.composable
    }

    pub fn into_composable(self) -> Composable {
        self.composable
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn error(&self) -> Option<&TransferError> {
        self.error.as_ref()
    }

    pub fn progress(&self) -> u64 {
        self.progress.get()
    }

    pub fn progress_handle(&self) -> Progress {
        self.progress.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start the transfer if it isn't in flight and wait until it
    ///  settles. Never fails: the outcome is the returned status, with
    ///  the cause available from [`Task::error`].
    ///
    /// Dropping the returned future does not affect the transfer.
    pub async fn settle(&mut self) -> TaskStatus {
        if self.running.is_none() {
            match self.status {
                TaskStatus::Done | TaskStatus::Failed => return self.status,
                TaskStatus::Downloading | TaskStatus::Pause => self.launch(),
            }
        }
        self.join().await;
        self.status
    }

    /// Ask the adapter to halt and wait for it to acknowledge.
    ///  Transferred bytes are kept for the next `settle`.
    pub async fn pause(&mut self) {
        if self.running.is_none() {
            if self.status == TaskStatus::Downloading {
                self.status = TaskStatus::Pause;
            }
            return;
        }
        self.signal.send_replace(Signal::Pause);
        self.join().await;
    }

    /// Hard cancel; the task is failed for good
    pub async fn stop(&mut self) {
        self.signal.send_replace(Signal::Stop);
        if self.running.is_some() {
            self.join().await;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(TransferError::Canceled);
    }

    fn launch(&mut self) {
        self.signal.send_replace(Signal::Run);
        self.status = TaskStatus::Downloading;
        self.error = None;

        let mut ctx = TransferContext::new(
            self.composable.clone(),
            self.output.clone(),
            self.progress.clone(),
            self.signal.subscribe(),
        );
        let adapter = self.adapter.clone();
        tracing::debug!(
            "starting transfer of {} at offset {}",
            self.composable.hash,
            self.progress.get()
        );
        self.running = Some(Running(tokio::spawn(async move {
            adapter.start(&mut ctx).await
        })));
    }

    // cancel safe: the handle stays in place until it has resolved
    async fn join(&mut self) {
        let Some(Running(handle)) = self.running.as_mut() else {
            return;
        };
        let result = handle.await;
        self.running = None;
        self.resolve(result);
    }

    fn resolve(&mut self, result: Result<Result<(), TransferError>, JoinError>) {
        let signal = *self.signal.borrow();
        match result {
            Ok(Ok(())) => {
                self.status = TaskStatus::Done;
                self.error = None;
            }
            Ok(Err(TransferError::Interrupted)) if signal == Signal::Pause => {
                self.status = TaskStatus::Pause;
            }
            Ok(Err(_)) if signal == Signal::Stop => {
                self.status = TaskStatus::Failed;
                self.error = Some(TransferError::Canceled);
            }
            Ok(Err(e)) => {
                tracing::debug!("transfer of {} failed: {}", self.composable.hash, e);
                self.status = TaskStatus::Failed;
                self.error = Some(e);
            }
            Err(e) => {
                self.status = TaskStatus::Failed;
                self.error = Some(TransferError::Aborted(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    use crate::hash::NixHash;

    // writes one byte at a time, resuming from the context's offset
    #[derive(Debug)]
    struct Trickle {
        data: Vec<u8>,
        offsets: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl TaskAdapter for Trickle {
        async fn start(&self, ctx: &mut TransferContext) -> Result<(), TransferError> {
            let offset = ctx.progress.get();
            self.offsets.lock().push(offset);
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&ctx.output)
                .await?;
            file.set_len(offset).await?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            for byte in &self.data[offset as usize..] {
                tokio::select! {
                    _ = ctx.interrupted() => return Err(TransferError::Interrupted),
                    _ = tokio::time::sleep(Duration::from_millis(2)) => {}
                }
                file.write_all(&[*byte]).await?;
                file.flush().await?;
                ctx.progress.add(1);
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl TaskAdapter for Broken {
        async fn start(&self, _ctx: &mut TransferContext) -> Result<(), TransferError> {
            Err(TransferError::Status(500))
        }
    }

    fn composable(size: u64) -> Composable {
        Composable::new(NixHash::from("chunk"), size)
    }

    #[tokio::test]
    async fn test_pause_resumes_from_offset() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("chunk");
        let data: Vec<u8> = (0..200u8).collect();
        let adapter = Arc::new(Trickle {
            data: data.clone(),
            offsets: Mutex::new(Vec::new()),
        });
        let mut task = Task::new(0, composable(200), output.clone(), adapter.clone());

        // let it run for a bit, then pause
        let early = tokio::time::timeout(Duration::from_millis(60), task.settle()).await;
        assert!(early.is_err());
        task.pause().await;
        assert_eq!(task.status(), TaskStatus::Pause);

        let paused_at = task.progress();
        assert!(paused_at > 0 && paused_at < 200);
        let on_disk = tokio::fs::metadata(&output).await.unwrap().len();
        assert_eq!(on_disk, paused_at);

        assert_eq!(task.settle().await, TaskStatus::Done);
        assert_eq!(task.progress(), 200);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), data);
        assert_eq!(*adapter.offsets.lock(), vec![0, paused_at]);
    }

    #[tokio::test]
    async fn test_stop_is_final() {
        let temp = TempDir::new().unwrap();
        let adapter = Arc::new(Trickle {
            data: vec![1u8; 500],
            offsets: Mutex::new(Vec::new()),
        });
        let mut task = Task::new(0, composable(500), temp.path().join("chunk"), adapter.clone());

        let _ = tokio::time::timeout(Duration::from_millis(10), task.settle()).await;
        task.stop().await;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(matches!(task.error(), Some(TransferError::Canceled)));

        // settling again does not restart the transfer
        assert_eq!(task.settle().await, TaskStatus::Failed);
        assert_eq!(adapter.offsets.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_settles_without_error() {
        let temp = TempDir::new().unwrap();
        let mut task = Task::new(3, composable(1), temp.path().join("chunk"), Arc::new(Broken));

        assert_eq!(task.settle().await, TaskStatus::Failed);
        assert!(matches!(task.error(), Some(TransferError::Status(500))));
        assert_eq!(task.source(), 3);
    }

    #[tokio::test]
    async fn test_pause_before_start() {
        let temp = TempDir::new().unwrap();
        let adapter = Arc::new(Trickle {
            data: vec![9u8; 4],
            offsets: Mutex::new(Vec::new()),
        });
        let mut task = Task::new(0, composable(4), temp.path().join("chunk"), adapter.clone());

        task.pause().await;
        assert_eq!(task.status(), TaskStatus::Pause);
        assert!(adapter.offsets.lock().is_empty());

        assert_eq!(task.settle().await, TaskStatus::Done);
    }
}
