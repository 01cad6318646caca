//! Sync lifecycle events
//!
//! A session reports everything it does through a closed set of [`Event`]s.
//! Listeners register per [`EventKind`] with [`EventBus::on`] or
//! [`EventBus::once`]; one-shot listeners remove themselves after firing.
//! Channel subscriptions go away once their receiver is dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hash::NixHash;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CheckStart,
    CheckFailed(String),
    DownloadStart,
    /// A task was created for `hash` against `source`
    ComposableStart { hash: NixHash, source: String },
    /// An attempt failed and the composable was marked for retry.
    ///  `remaining` is the budget left before this retry.
    ComposableRetry {
        hash: NixHash,
        source: String,
        remaining: u32,
    },
    /// `source` is `None` when a valid local copy was reused
    ComposableDone {
        hash: NixHash,
        source: Option<String>,
    },
    DownloadDone,
    DownloadFailed(String),
    LinkStart,
    LinkDone,
    LinkFailed(String),
    Done(PathBuf),
    Failed(String),
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CheckStart,
    CheckFailed,
    DownloadStart,
    ComposableStart,
    ComposableRetry,
    ComposableDone,
    DownloadDone,
    DownloadFailed,
    LinkStart,
    LinkDone,
    LinkFailed,
    Done,
    Failed,
    Canceled,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::CheckStart => EventKind::CheckStart,
            Event::CheckFailed(_) => EventKind::CheckFailed,
            Event::DownloadStart => EventKind::DownloadStart,
            Event::ComposableStart { .. } => EventKind::ComposableStart,
            Event::ComposableRetry { .. } => EventKind::ComposableRetry,
            Event::ComposableDone { .. } => EventKind::ComposableDone,
            Event::DownloadDone => EventKind::DownloadDone,
            Event::DownloadFailed(_) => EventKind::DownloadFailed,
            Event::LinkStart => EventKind::LinkStart,
            Event::LinkDone => EventKind::LinkDone,
            Event::LinkFailed(_) => EventKind::LinkFailed,
            Event::Done(_) => EventKind::Done,
            Event::Failed(_) => EventKind::Failed,
            Event::Canceled => EventKind::Canceled,
        }
    }
}

impl EventKind {
    /// The wire-style name of the event, e.g. `download/composable/retry`
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CheckStart => "check/start",
            EventKind::CheckFailed => "check/failed",
            EventKind::DownloadStart => "download/start",
            EventKind::ComposableStart => "download/composable/start",
            EventKind::ComposableRetry => "download/composable/retry",
            EventKind::ComposableDone => "download/composable/done",
            EventKind::DownloadDone => "download/done",
            EventKind::DownloadFailed => "download/failed",
            EventKind::LinkStart => "link/start",
            EventKind::LinkDone => "link/done",
            EventKind::LinkFailed => "link/failed",
            EventKind::Done => "done",
            EventKind::Failed => "failed",
            EventKind::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Returns `false` when the listener should be dropped
type Callback = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Listener {
    id: ListenerId,
    once: bool,
    /// Listeners registered together by one `subscribe` call
    group: Option<u64>,
    callback: Callback,
}

/// Registry of listener lists keyed by event kind.
///  Cheap to clone; clones share the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<HashMap<EventKind, Vec<Listener>>>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self.listeners.lock().values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(move |event: &Event| {
            callback(event);
            true
        }))
    }

    pub fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(move |event: &Event| {
            callback(event);
            true
        }))
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        for list in listeners.values_mut() {
            if let Some(position) = list.iter().position(|l| l.id == id) {
                list.remove(position);
                return true;
            }
        }
        false
    }

    /// Forward every event into a channel. The listeners behind it are
    ///  all removed on the first event after the receiver is dropped.
    pub fn subscribe(&self) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        let group = self.next_id.fetch_add(1, Ordering::Relaxed);
        for kind in ALL_KINDS {
            let tx = tx.clone();
            let callback = Arc::new(move |event: &Event| tx.send(event.clone()).is_ok());
            self.insert(kind, false, Some(group), callback);
        }
        rx
    }

    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        // callbacks run outside the lock so they may register or remove listeners
        let callbacks: Vec<(ListenerId, Callback)> = {
            let mut listeners = self.listeners.lock();
            match listeners.get_mut(&kind) {
                Some(list) => {
                    let callbacks = list.iter().map(|l| (l.id, l.callback.clone())).collect();
                    list.retain(|l| !l.once);
                    callbacks
                }
                None => Vec::new(),
            }
        };
        tracing::trace!("emit {} to {} listener(s)", kind.as_str(), callbacks.len());

        let dead: Vec<ListenerId> = callbacks
            .into_iter()
            .filter(|(_, callback)| !callback(&event))
            .map(|(id, _)| id)
            .collect();
        if !dead.is_empty() {
            let mut listeners = self.listeners.lock();
            let groups: Vec<u64> = listeners
                .values()
                .flatten()
                .filter(|l| dead.contains(&l.id))
                .filter_map(|l| l.group)
                .collect();
            for list in listeners.values_mut() {
                list.retain(|l| {
                    !dead.contains(&l.id) && !l.group.is_some_and(|group| groups.contains(&group))
                });
            }
        }
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    fn register(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        self.insert(kind, once, None, callback)
    }

    fn insert(&self, kind: EventKind, once: bool, group: Option<u64>, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().entry(kind).or_default().push(Listener {
            id,
            once,
            group,
            callback,
        });
        id
    }
}

const ALL_KINDS: [EventKind; 14] = [
    EventKind::CheckStart,
    EventKind::CheckFailed,
    EventKind::DownloadStart,
    EventKind::ComposableStart,
    EventKind::ComposableRetry,
    EventKind::ComposableDone,
    EventKind::DownloadDone,
    EventKind::DownloadFailed,
    EventKind::LinkStart,
    EventKind::LinkDone,
    EventKind::LinkFailed,
    EventKind::Done,
    EventKind::Failed,
    EventKind::Canceled,
];
