//! Sync sessions
//!
//! A [`Session`] owns one sync of one bucket from a set of sources:
//!
//! ```text
//!  checking ──> downloading <──> pause
//!     │              │   \          \
//!     │              │    └──────────┴──> canceled
//!     │              v
//!     │           linking ──> done
//!     │              │
//!     └──────────────┴──────> failed
//! ```
//!
//! Checking fetches every source's index concurrently and keeps the ones
//!  that carry the bucket (at the pinned hash, if any). Downloading runs
//!  the [`Scheduler`] one step at a time so pause / resume / cancel take
//!  effect between steps. Linking rebuilds the tree from the store.
//!
//! Outcomes are only reported through the phase, the event bus and
//!  [`Session::wait`]; the background driver never panics out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::events::{Event, EventBus};
use crate::hash::NixHash;
use crate::index::{ClosureError, Composable, Index, DEFAULT_INDEX_NAME};
use crate::linker::{self, LinkError, Linker};
use crate::scheduler::{Control, ProgressTracker, Scheduler, Step};
use crate::source::{Source, SourceError};
use crate::store::{Store, StoreError, STORE_DIR_NAME};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_TASK_COUNT: usize = 10;
pub const DEFAULT_RETRY: u32 = 3;
pub const DEFAULT_OUTPUT_DIR: &str = "nereid";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Per request, and per stall while streaming
    pub timeout: Duration,
    /// Re-hash every linked file against its node hash
    pub check_file_hash: bool,
    /// Index file name, relative to each source
    pub index: String,
    /// Holds `store/` and the linked bucket
    pub output: PathBuf,
    pub max_task_count: usize,
    /// Expected root hash of the bucket
    pub hash: Option<NixHash>,
    /// Retries per composable on top of the first attempt
    pub retry: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            check_file_hash: false,
            index: DEFAULT_INDEX_NAME.to_string(),
            output: PathBuf::from(DEFAULT_OUTPUT_DIR),
            max_task_count: DEFAULT_MAX_TASK_COUNT,
            hash: None,
            retry: DEFAULT_RETRY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no source is available")]
    NoSourceAvailable,
    #[error("failed to download {hash}: {reason}")]
    RetriesExhausted { hash: NixHash, reason: String },
    #[error("index fetch timed out")]
    CheckTimeout,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Closure(#[from] ClosureError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("link failed: {0}")]
    Link(#[from] LinkError),
    #[error("output directory error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Checking,
    Downloading,
    Pause,
    Linking,
    Done,
    Failed,
    Canceled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Checking => "checking",
            Phase::Downloading => "downloading",
            Phase::Pause => "pause",
            Phase::Linking => "linking",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Canceled)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done(PathBuf),
    Failed(String),
    Canceled,
}

#[derive(Debug)]
struct Job {
    sources: Vec<Source>,
    bucket: String,
    options: SyncOptions,
}

#[derive(Debug)]
struct Shared {
    phase: watch::Sender<Phase>,
    control: watch::Sender<Control>,
    events: EventBus,
    tracker: Arc<ProgressTracker>,
    outcome: watch::Sender<Option<Outcome>>,
    job: Mutex<Option<Job>>,
}

/// Handle to one sync. Cheap to clone; clones drive the same session.
#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// Create a session from source URIs and start it right away.
///  Listeners registered on the returned session may miss the first
///  events; use [`Session::from_uris`] and [`Session::start`] to
///  register before anything is emitted.
pub fn sync<S: AsRef<str>>(uris: &[S], bucket: &str, options: SyncOptions) -> Session {
    let session = Session::from_uris(uris, bucket, options);
    session.start();
    session
}

impl Session {
    /// Prepare a session; nothing happens until [`Session::start`]
    pub fn new(sources: Vec<Source>, bucket: impl Into<String>, options: SyncOptions) -> Self {
        let (phase, _) = watch::channel(Phase::Checking);
        let (control, _) = watch::channel(Control::Run);
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                phase,
                control,
                events: EventBus::new(),
                tracker: Arc::new(ProgressTracker::new()),
                outcome,
                job: Mutex::new(Some(Job {
                    sources,
                    bucket: bucket.into(),
                    options,
                })),
            }),
        }
    }

    /// Like [`Session::new`], building sources from URIs.
    ///  URIs that can't be turned into a source are skipped.
    pub fn from_uris<S: AsRef<str>>(uris: &[S], bucket: impl Into<String>, options: SyncOptions) -> Self {
        let sources = uris
            .iter()
            .filter_map(|uri| match Source::from_uri(uri.as_ref(), options.timeout) {
                Ok(source) => Some(source),
                Err(e) => {
                    tracing::warn!("unsupported source {}: {}", uri.as_ref(), e);
                    None
                }
            })
            .collect();
        Self::new(sources, bucket, options)
    }

    /// Spawn the driver on the current tokio runtime. Later calls do nothing.
    pub fn start(&self) {
        let Some(job) = self.shared.job.lock().take() else {
            return;
        };
        tokio::spawn(drive(self.shared.clone(), job));
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.shared.phase.subscribe()
    }

    /// Transferred fraction of the closure, in [0, 1]
    pub fn progress(&self) -> f64 {
        match self.phase() {
            Phase::Checking => 0.0,
            Phase::Done => 1.0,
            _ => self.shared.tracker.fraction(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Pause downloading. Requested while checking, it applies as soon
    ///  as downloading starts.
    pub fn pause(&self) {
        if !matches!(self.phase(), Phase::Checking | Phase::Downloading) {
            return;
        }
        self.shared.control.send_if_modified(|control| {
            if *control == Control::Run {
                *control = Control::Pause;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.shared.control.send_if_modified(|control| {
            if *control == Control::Pause {
                *control = Control::Run;
                true
            } else {
                false
            }
        });
    }

    /// Stop every transfer and end the session as canceled. Bytes already
    ///  in the store stay there for the next session.
    pub fn cancel(&self) {
        if !matches!(
            self.phase(),
            Phase::Checking | Phase::Downloading | Phase::Pause
        ) {
            return;
        }
        self.shared.control.send_replace(Control::Cancel);
    }

    /// Wait until the session has ended and its last event was emitted.
    ///  Never resolves for a session that was not started.
    pub async fn wait(&self) -> Outcome {
        let mut outcome = self.shared.outcome.subscribe();
        let result = outcome.wait_for(Option::is_some).await;
        match result {
            Ok(outcome) => outcome.clone().unwrap_or(Outcome::Canceled),
            Err(_) => Outcome::Canceled,
        }
    }
}

async fn drive(shared: Arc<Shared>, job: Job) {
    let Job {
        sources,
        bucket,
        options,
    } = job;

    let result = run(&shared, sources, &bucket, &options).await;
    let (outcome, phase) = match result {
        Ok(Some(path)) => (Outcome::Done(path), Phase::Done),
        Ok(None) => {
            tracing::info!("sync of {} canceled", bucket);
            (Outcome::Canceled, Phase::Canceled)
        }
        Err(e) => {
            tracing::error!("sync of {} failed: {}", bucket, e);
            (Outcome::Failed(e.to_string()), Phase::Failed)
        }
    };

    shared.phase.send_replace(phase);
    shared.events.emit(match &outcome {
        Outcome::Done(path) => Event::Done(path.clone()),
        Outcome::Failed(error) => Event::Failed(error.clone()),
        Outcome::Canceled => Event::Canceled,
    });
    shared.outcome.send_replace(Some(outcome));
}

// Ok(None) means canceled
async fn run(
    shared: &Shared,
    sources: Vec<Source>,
    bucket: &str,
    options: &SyncOptions,
) -> Result<Option<PathBuf>, SyncError> {
    shared.events.emit(Event::CheckStart);
    let store_root = options.output.join(STORE_DIR_NAME);
    tokio::fs::create_dir_all(&store_root).await?;

    /* checking */

    let results = join_all(sources.iter().map(|source| check(source, bucket, options))).await;
    let mut available = Vec::new();
    let mut chosen: Option<(Index, Vec<Composable>)> = None;
    for (mut source, result) in sources.into_iter().zip(results) {
        match result {
            Ok((index, closure)) => {
                if chosen.is_none() {
                    chosen = Some((index.clone(), closure));
                }
                source.set_index(index);
                available.push(source);
            }
            Err(e) => tracing::warn!("dropping source {}: {}", source.address(), e),
        }
    }
    let Some((index, closure)) = chosen else {
        let error = SyncError::NoSourceAvailable;
        shared.events.emit(Event::CheckFailed(error.to_string()));
        return Err(error);
    };
    tracing::info!(
        "{} of bucket {} needs {} composables from {} source(s)",
        options.output.display(),
        bucket,
        closure.len(),
        available.len()
    );

    let target = options.output.join(bucket);
    if let Some(root) = index.bucket(bucket) {
        if linker::materialized(root, target.clone()).await {
            tracing::info!("{} already exists", target.display());
            return Ok(Some(target));
        }
    }

    /* downloading */

    let store = Store::open(&store_root, index.hash_mode).await?;
    let mut scheduler = Scheduler::new(
        available,
        store.clone(),
        closure,
        options.max_task_count,
        shared.events.clone(),
        shared.tracker.clone(),
    )?;
    let mut control = shared.control.subscribe();

    shared.phase.send_replace(Phase::Downloading);
    shared.events.emit(Event::DownloadStart);
    loop {
        let step = match scheduler.step(&mut control).await {
            Ok(step) => step,
            Err(e) => {
                shared.events.emit(Event::DownloadFailed(e.to_string()));
                return Err(e);
            }
        };
        match step {
            Step::Continue => {}
            Step::Paused => {
                shared.phase.send_replace(Phase::Pause);
                tracing::info!("sync of {} paused", bucket);
                let next = control
                    .wait_for(|control| *control != Control::Pause)
                    .await
                    .map(|control| *control)
                    .unwrap_or(Control::Cancel);
                if next == Control::Run {
                    tracing::info!("sync of {} resumed", bucket);
                    shared.phase.send_replace(Phase::Downloading);
                }
            }
            Step::Canceled => return Ok(None),
            Step::Finished => break,
        }
    }
    for source in scheduler.sources() {
        tracing::debug!("source {} ends with weight {}", source.address(), source.weight());
    }
    shared.events.emit(Event::DownloadDone);

    /* linking */

    shared.phase.send_replace(Phase::Linking);
    shared.events.emit(Event::LinkStart);
    match Linker::new(store, options.check_file_hash)
        .link(&index, bucket, &options.output)
        .await
    {
        Ok(path) => {
            shared.events.emit(Event::LinkDone);
            Ok(Some(path))
        }
        Err(e) => {
            shared.events.emit(Event::LinkFailed(e.to_string()));
            Err(e.into())
        }
    }
}

async fn check(
    source: &Source,
    bucket: &str,
    options: &SyncOptions,
) -> Result<(Index, Vec<Composable>), SyncError> {
    let index = tokio::time::timeout(options.timeout, source.fetch_index(&options.index))
        .await
        .map_err(|_| SyncError::CheckTimeout)??;
    let closure = index.closure(bucket, options.hash.as_ref(), options.retry)?;
    Ok((index, closure))
}
