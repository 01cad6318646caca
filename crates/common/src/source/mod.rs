//! Chunk sources
//!
//! A [`Source`] is one place composables can come from. It couples a
//!  [`Transport`] (how to fetch the index and how to move a chunk) with
//!  the bookkeeping the scheduler needs: a selection weight and the index
//!  it served during the check phase.
//!
//! Sources are described by URI and dispatched on scheme:
//!
//! ```text
//! http://host/path, https://...    -> HttpTransport      (range resumable)
//! file:///some/dir                 -> FileTransport      (seek + copy)
//! npm://org/pkg?registry=<url>     -> RegistryTransport  (tarball per chunk)
//! <other>://org?registry=<url>     -> RegistryTransport
//! ```

mod file;
mod http;
mod registry;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::index::{Composable, Index};
use crate::task::{Task, TaskAdapter, TransferError};

pub use file::FileTransport;
pub use http::HttpTransport;
pub use registry::{RegistryTransport, DEFAULT_NPM_REGISTRY};

/// Weight every source starts with
pub const INITIAL_WEIGHT: i64 = 10;

/// Sampling never sees a weight below this, so a source that failed a lot
///  keeps a small chance and the total stays positive
pub const MIN_SAMPLING_WEIGHT: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid source uri {0}: {1}")]
    InvalidUri(String, String),
    #[error("registry source {0} needs a ?registry= parameter")]
    MissingRegistry(String),
    #[error("index not found at {0}")]
    IndexNotFound(String),
    #[error("source http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("source i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed index: {0}")]
    Json(#[from] serde_json::Error),
    #[error("source transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// The two things a transport must know how to do
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Fetch and decode the index file called `name`
    async fn fetch_index(&self, name: &str) -> Result<Index, SourceError>;

    /// Build the adapter that moves `composable` from this transport
    fn task(&self, composable: &Composable) -> Arc<dyn TaskAdapter>;
}

#[derive(Debug)]
pub struct Source {
    address: String,
    weight: i64,
    index: Option<Index>,
    transport: Arc<dyn Transport>,
}

impl Source {
    pub fn new(address: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            address: address.into(),
            weight: INITIAL_WEIGHT,
            index: None,
            transport,
        }
    }

    /// Pick a transport from the URI scheme. `timeout` bounds each
    ///  request and each stall while streaming.
    pub fn from_uri(uri: &str, timeout: Duration) -> Result<Self, SourceError> {
        let url =
            Url::parse(uri).map_err(|e| SourceError::InvalidUri(uri.to_string(), e.to_string()))?;
        let transport: Arc<dyn Transport> = match url.scheme() {
            "http" | "https" => Arc::new(HttpTransport::new(uri, timeout)?),
            "file" => {
                let root: PathBuf = url.to_file_path().map_err(|_| {
                    SourceError::InvalidUri(uri.to_string(), "not a local path".to_string())
                })?;
                Arc::new(FileTransport::new(root))
            }
            _ => Arc::new(RegistryTransport::from_url(&url, timeout)?),
        };
        Ok(Self::new(uri, transport))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> i64 {
        self.weight
    }

    pub fn sampling_weight(&self) -> f64 {
        (self.weight as f64).max(MIN_SAMPLING_WEIGHT)
    }

    pub fn reward(&mut self) {
        self.weight += 1;
    }

    pub fn penalize(&mut self) {
        self.weight -= 1;
    }

    /// The index this source served during the check phase
    pub fn index(&self) -> Option<&Index> {
        self.index.as_ref()
    }

    pub fn set_index(&mut self, index: Index) {
        self.index = Some(index);
    }

    pub async fn fetch_index(&self, name: &str) -> Result<Index, SourceError> {
        self.transport.fetch_index(name).await
    }

    /// Create a fresh task moving `composable` into `output`.
    ///  `id` is the caller's handle for this source.
    pub fn task(&self, id: usize, composable: Composable, output: PathBuf) -> Task {
        let adapter = self.transport.task(&composable);
        Task::new(id, composable, output, adapter)
    }
}
