//! Shared helpers for sync integration tests
#![allow(dead_code)]

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use common::builder::{build, BuildOptions};
use common::events::Event;
use common::index::{Composable, Index};
use common::session::{Outcome, Session, SyncOptions};
use common::source::{SourceError, Transport};
use common::store::STORE_DIR_NAME;
use common::task::{TaskAdapter, TransferContext, TransferError};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tower_http::services::ServeDir;

/// Chunk size used by tests, small enough to get several chunks per file
pub const CHUNK: usize = 64;

pub enum Entry<'a> {
    File(&'a [u8]),
    Dir,
    Symlink(&'a str),
}

/// Create `root` and the given entries below it, parents first
pub fn write_tree(root: &Path, entries: &[(&str, Entry)]) {
    std::fs::create_dir_all(root).unwrap();
    for (path, entry) in entries {
        let path = root.join(path);
        match entry {
            Entry::File(data) => std::fs::write(&path, data).unwrap(),
            Entry::Dir => std::fs::create_dir_all(&path).unwrap(),
            Entry::Symlink(target) => std::os::unix::fs::symlink(target, &path).unwrap(),
        }
    }
}

/// Write the tree to `{temp}/src/app` and build it into `{temp}/build`.
///  Returns the source tree and the build output.
pub async fn build_bucket(temp: &TempDir, entries: &[(&str, Entry<'_>)]) -> (PathBuf, PathBuf, Index) {
    let src = temp.path().join("src").join("app");
    write_tree(&src, entries);
    let dst = temp.path().join("build");
    let options = BuildOptions {
        chunk_size: CHUNK,
        ..Default::default()
    };
    let index = build(&src, &dst, &options).await.unwrap();
    (src, dst, index)
}

pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

pub fn sync_options(output: &Path) -> SyncOptions {
    SyncOptions {
        output: output.to_path_buf(),
        timeout: Duration::from_secs(5),
        check_file_hash: true,
        ..Default::default()
    }
}

/// Route library logs to the test harness, `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run a session to completion, collecting every event it emitted
pub async fn run_session(session: Session) -> (Outcome, Vec<Event>) {
    init_tracing();
    let events = session.events().subscribe();
    session.start();
    let outcome = tokio::time::timeout(Duration::from_secs(30), session.wait())
        .await
        .expect("session did not finish");
    (outcome, events.drain().collect())
}

pub fn count(events: &[Event], f: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|event| f(event)).count()
}

/// Compare two trees: same names, kinds, contents, link targets and modes
pub fn assert_same_tree(expected: &Path, actual: &Path) {
    let want = std::fs::symlink_metadata(expected).unwrap();
    let got = std::fs::symlink_metadata(actual)
        .unwrap_or_else(|e| panic!("{} is missing: {}", actual.display(), e));

    if want.file_type().is_symlink() {
        assert!(got.file_type().is_symlink(), "{} is not a symlink", actual.display());
        assert_eq!(
            std::fs::read_link(expected).unwrap(),
            std::fs::read_link(actual).unwrap()
        );
        return;
    }

    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(
            want.permissions().mode() & 0o7777,
            got.permissions().mode() & 0o7777,
            "mode of {}",
            actual.display()
        );
    }

    if want.is_dir() {
        assert!(got.is_dir(), "{} is not a directory", actual.display());
        let names = |path: &Path| {
            let mut names: Vec<_> = std::fs::read_dir(path)
                .unwrap()
                .map(|entry| entry.unwrap().file_name())
                .collect();
            names.sort();
            names
        };
        let expected_names = names(expected);
        assert_eq!(expected_names, names(actual), "entries of {}", actual.display());
        for name in expected_names {
            assert_same_tree(&expected.join(&name), &actual.join(&name));
        }
    } else {
        assert!(got.is_file(), "{} is not a file", actual.display());
        assert_eq!(
            std::fs::read(expected).unwrap(),
            std::fs::read(actual).unwrap(),
            "content of {}",
            actual.display()
        );
    }
}

pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Serve a build output over HTTP, with range support
pub async fn serve_dir(path: &Path) -> String {
    serve(Router::new().fallback_service(ServeDir::new(path))).await
}

#[derive(Debug, Default)]
pub struct Counters {
    pub attempts: AtomicUsize,
    pub failures: AtomicUsize,
    pub successes: AtomicUsize,
    /// Bytes written to outputs over all attempts
    pub written: AtomicU64,
    /// Offset each attempt started from
    pub offsets: Mutex<Vec<u64>>,
}

impl Counters {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }
}

/// Serves a build output from disk like a file source, but can be made
///  to fail every transfer, to hand out wrong bytes or to trickle bytes
///  out slowly
#[derive(Debug, Clone)]
pub struct MockTransport {
    root: PathBuf,
    fail: bool,
    corrupt: bool,
    pace: Option<Duration>,
    counters: Arc<Counters>,
}

impl MockTransport {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            fail: false,
            corrupt: false,
            pace: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn failing(root: &Path) -> Self {
        Self {
            fail: true,
            ..Self::new(root)
        }
    }

    /// Transfers succeed, but every byte written is flipped
    pub fn corrupting(root: &Path) -> Self {
        Self {
            corrupt: true,
            ..Self::new(root)
        }
    }

    /// Write 16 bytes per `pace`
    pub fn paced(root: &Path, pace: Duration) -> Self {
        Self {
            pace: Some(pace),
            ..Self::new(root)
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_index(&self, name: &str) -> Result<Index, SourceError> {
        let raw = tokio::fs::read(self.root.join(name)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn task(&self, composable: &Composable) -> Arc<dyn TaskAdapter> {
        Arc::new(MockTask {
            path: self
                .root
                .join(STORE_DIR_NAME)
                .join(composable.hash.as_str()),
            fail: self.fail,
            corrupt: self.corrupt,
            pace: self.pace,
            counters: self.counters.clone(),
        })
    }
}

#[derive(Debug)]
struct MockTask {
    path: PathBuf,
    fail: bool,
    corrupt: bool,
    pace: Option<Duration>,
    counters: Arc<Counters>,
}

#[async_trait]
impl TaskAdapter for MockTask {
    async fn start(&self, ctx: &mut TransferContext) -> Result<(), TransferError> {
        let offset = ctx.progress.get();
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        self.counters.offsets.lock().push(offset);

        if self.fail {
            self.counters.failures.fetch_add(1, Ordering::SeqCst);
            return Err(TransferError::Status(503));
        }

        let mut data = tokio::fs::read(&self.path).await?;
        if self.corrupt {
            data.iter_mut().for_each(|byte| *byte = !*byte);
        }
        let mut output = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&ctx.output)
            .await?;
        output.set_len(offset).await?;
        output.seek(SeekFrom::Start(offset)).await?;

        let piece = if self.pace.is_some() { 16 } else { data.len().max(1) };
        for bytes in data[offset as usize..].chunks(piece) {
            if let Some(pace) = self.pace {
                tokio::select! {
                    biased;
                    _ = ctx.interrupted() => {
                        output.flush().await?;
                        return Err(TransferError::Interrupted);
                    }
                    _ = tokio::time::sleep(pace) => {}
                }
            }
            output.write_all(bytes).await?;
            output.flush().await?;
            ctx.progress.add(bytes.len() as u64);
            self.counters
                .written
                .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        }
        self.counters.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
