//! Download scheduler
//!
//! Moves a bucket's closure into the local store with at most
//!  `max_tasks` transfers in flight, spread over weighted sources.
//!
//! ```text
//!  pending ──top up──> valid in store? ──yes──> done (no task)
//!                         │ no
//!                         v
//!                 sample source by weight ──> Task ──settle──┐
//!                                                            │
//!        ┌──────── failed / bad hash: weight -1, retry ──────┤
//!        v                                                   │
//!   budget left? ── no ──> RetriesExhausted          ok: weight +1, done
//!        │ yes
//!        └──> pending (resampled next time)
//! ```
//!
//! The loop is advanced one [`Scheduler::step`] at a time. Each step
//!  waits for whichever in-flight task settles first, or for the control
//!  signal to change, so pause and cancel land between steps.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{join_all, select_all};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;

use crate::events::{Event, EventBus};
use crate::hash::NixHash;
use crate::index::Composable;
use crate::session::SyncError;
use crate::source::Source;
use crate::store::Store;
use crate::task::{Progress, Task, TaskStatus};

/// What the owner of the session wants the scheduler to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Cancel,
}

/// Where the scheduler is after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work to do, call `step` again
    Continue,
    /// Every in-flight task acknowledged the pause
    Paused,
    /// Every in-flight task was stopped
    Canceled,
    /// Pending queue and in-flight set are both empty
    Finished,
}

/// Byte accounting for a running closure, readable from any thread
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total: AtomicU64,
    completed: AtomicU64,
    in_flight: Mutex<HashMap<NixHash, Progress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Bytes held by finished chunks plus bytes of in-flight transfers
    pub fn transferred(&self) -> u64 {
        let in_flight: u64 = self.in_flight.lock().values().map(Progress::get).sum();
        self.completed.load(Ordering::Acquire) + in_flight
    }

    /// Fraction in [0, 1]; an empty closure counts as complete
    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        (self.transferred() as f64 / total as f64).min(1.0)
    }

    fn track(&self, hash: NixHash, progress: Progress) {
        self.in_flight.lock().insert(hash, progress);
    }

    fn forget(&self, hash: &NixHash) {
        self.in_flight.lock().remove(hash);
    }

    fn complete(&self, composable: &Composable) {
        self.forget(&composable.hash);
        self.completed.fetch_add(composable.size, Ordering::AcqRel);
    }
}

/// Draw an index with probability proportional to its weight.
///  Returns `None` when there is nothing to draw from.
pub fn sample<R: Rng>(weights: &[f64], rng: &mut R) -> Option<usize> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || total <= 0.0 {
        return None;
    }
    let mut draw = rng.random_range(0.0..total);
    for (i, weight) in weights.iter().enumerate() {
        if draw < *weight {
            return Some(i);
        }
        draw -= weight;
    }
    // float rounding at the very top of the range
    Some(weights.len() - 1)
}

pub struct Scheduler {
    sources: Vec<Source>,
    store: Store,
    pending: VecDeque<Composable>,
    running: Vec<Task>,
    max_tasks: usize,
    events: EventBus,
    tracker: Arc<ProgressTracker>,
    rng: StdRng,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("sources", &self.sources.len())
            .field("pending", &self.pending.len())
            .field("running", &self.running.len())
            .field("max_tasks", &self.max_tasks)
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        sources: Vec<Source>,
        store: Store,
        composables: Vec<Composable>,
        max_tasks: usize,
        events: EventBus,
        tracker: Arc<ProgressTracker>,
    ) -> Result<Self, SyncError> {
        if sources.is_empty() {
            return Err(SyncError::NoSourceAvailable);
        }
        tracker.set_total(composables.iter().map(|c| c.size).sum());
        Ok(Self {
            sources,
            store,
            pending: composables.into(),
            running: Vec::new(),
            max_tasks: max_tasks.max(1),
            events,
            tracker,
            rng: StdRng::from_os_rng(),
        })
    }

    /// Replace the random source used for sampling
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn into_sources(self) -> Vec<Source> {
        let Self { sources, .. } = self;
        sources
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Drive every step until the closure is complete, the scheduler is
    ///  canceled, or a composable runs out of retries. Pauses are waited
    ///  out in place.
    pub async fn run(&mut self, control: &mut watch::Receiver<Control>) -> Result<Step, SyncError> {
        loop {
            match self.step(control).await? {
                Step::Continue => continue,
                Step::Paused => {
                    let resumed = control
                        .wait_for(|signal| *signal != Control::Pause)
                        .await
                        .map(|signal| *signal);
                    if !matches!(resumed, Ok(Control::Run)) {
                        self.stop_all().await;
                        return Ok(Step::Canceled);
                    }
                }
                done => return Ok(done),
            }
        }
    }

    /// Advance the loop by one settled task or one control change
    pub async fn step(&mut self, control: &mut watch::Receiver<Control>) -> Result<Step, SyncError> {
        let result = self.try_step(control).await;
        if result.is_err() {
            self.stop_all().await;
        }
        result
    }

    async fn try_step(&mut self, control: &mut watch::Receiver<Control>) -> Result<Step, SyncError> {
        if *control.borrow() == Control::Cancel {
            self.stop_all().await;
            return Ok(Step::Canceled);
        }
        self.top_up().await?;

        let signal = *control.borrow_and_update();
        match signal {
            Control::Pause => {
                join_all(self.running.iter_mut().map(Task::pause)).await;
                return Ok(Step::Paused);
            }
            Control::Cancel => {
                self.stop_all().await;
                return Ok(Step::Canceled);
            }
            Control::Run => {}
        }

        if self.running.is_empty() {
            return Ok(Step::Finished);
        }

        let settled = {
            let race = select_all(self.running.iter_mut().map(|task| Box::pin(task.settle())));
            tokio::select! {
                (_, index, _) = race => Some(index),
                changed = control.changed() => {
                    if changed.is_err() {
                        // nobody can resume or cancel anymore
                        None
                    } else {
                        return Ok(Step::Continue);
                    }
                }
            }
        };

        match settled {
            Some(index) => {
                let task = self.running.swap_remove(index);
                self.resolve(task).await
            }
            None => {
                self.stop_all().await;
                Ok(Step::Canceled)
            }
        }
    }

    async fn top_up(&mut self) -> Result<(), SyncError> {
        while self.running.len() < self.max_tasks {
            let Some(composable) = self.pending.pop_front() else {
                break;
            };

            if self.store.validate(&composable.hash).await? {
                tracing::debug!("{} already in store", composable.hash);
                self.tracker.complete(&composable);
                self.events.emit(Event::ComposableDone {
                    hash: composable.hash,
                    source: None,
                });
                continue;
            }
            self.store.remove(&composable.hash).await?;

            let weights: Vec<f64> = self.sources.iter().map(Source::sampling_weight).collect();
            let id = sample(&weights, &mut self.rng).unwrap_or(0);
            let source = &self.sources[id];

            let output = self.store.path(&composable.hash);
            let hash = composable.hash.clone();
            let task = source.task(id, composable, output);
            self.tracker.track(hash.clone(), task.progress_handle());
            self.events.emit(Event::ComposableStart {
                hash,
                source: source.address().to_string(),
            });
            self.running.push(task);
        }
        Ok(())
    }

    async fn resolve(&mut self, task: Task) -> Result<Step, SyncError> {
        let id = task.source();
        let reason = match task.status() {
            TaskStatus::Done => {
                let hash = &task.composable().hash;
                if self.store.validate(hash).await? {
                    let source = &mut self.sources[id];
                    source.reward();
                    self.tracker.complete(task.composable());
                    self.events.emit(Event::ComposableDone {
                        hash: hash.clone(),
                        source: Some(source.address().to_string()),
                    });
                    return Ok(Step::Continue);
                }
                tracing::warn!(
                    "{} from {} does not match its hash",
                    hash,
                    self.sources[id].address()
                );
                format!("hash mismatch for {}", hash)
            }
            TaskStatus::Failed => task
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "transfer failed".to_string()),
            TaskStatus::Downloading | TaskStatus::Pause => {
                // settled by a pause that raced the step, pick it up next time
                self.running.push(task);
                return Ok(Step::Continue);
            }
        };

        let source = &mut self.sources[id];
        source.penalize();
        let address = source.address().to_string();
        let mut composable = task.into_composable();
        self.tracker.forget(&composable.hash);

        tracing::debug!(
            "{} from {} failed ({}), {} retries left",
            composable.hash,
            address,
            reason,
            composable.retry
        );
        self.events.emit(Event::ComposableRetry {
            hash: composable.hash.clone(),
            source: address,
            remaining: composable.retry,
        });

        if composable.retry == 0 {
            return Err(SyncError::RetriesExhausted {
                hash: composable.hash,
                reason,
            });
        }
        composable.retry -= 1;
        self.pending.push_back(composable);
        Ok(Step::Continue)
    }

    async fn stop_all(&mut self) {
        join_all(self.running.iter_mut().map(Task::stop)).await;
        for task in self.running.drain(..) {
            self.tracker.forget(&task.composable().hash);
        }
    }
}
