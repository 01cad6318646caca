use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use common::events::Event;
use common::hash::NixHash;
use common::session::{Outcome, Session, SyncOptions};

use crate::config::SyncConfig;

#[derive(Args, Debug, Clone)]
pub struct Sync {
    /// Bucket to materialize
    pub bucket: String,

    /// Source to pull from, repeatable. `file://`, `http(s)://`,
    ///  `npm://org/pkg` or `<name>://org/pkg?registry=<url>`
    #[arg(long = "source", short = 's')]
    pub sources: Vec<String>,

    /// Directory holding `store/` and the materialized bucket
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Only accept an index whose bucket root has this hash
    #[arg(long)]
    pub pin: Option<String>,

    /// Re-hash every linked file
    #[arg(long)]
    pub check_file_hash: bool,

    #[arg(long)]
    pub max_tasks: Option<usize>,

    /// Retries per composable on top of the first attempt
    #[arg(long)]
    pub retry: Option<u32>,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Index file name, relative to each source
    #[arg(long)]
    pub index: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncOpError {
    #[error("no sources given, pass --source or set sync.sources in the config")]
    NoSources,

    #[error("sync failed: {0}")]
    Failed(String),

    #[error("sync canceled")]
    Canceled,
}

impl Sync {
    fn options(&self, config: &SyncConfig) -> SyncOptions {
        let mut options = config.options();
        if let Some(output) = &self.output {
            options.output = output.clone();
        }
        if let Some(index) = &self.index {
            options.index = index.clone();
        }
        if let Some(max_tasks) = self.max_tasks {
            options.max_task_count = max_tasks;
        }
        if let Some(retry) = self.retry {
            options.retry = retry;
        }
        if let Some(secs) = self.timeout_secs {
            options.timeout = Duration::from_secs(secs);
        }
        if self.check_file_hash {
            options.check_file_hash = true;
        }
        options.hash = self.pin.as_deref().map(NixHash::from);
        options
    }

    fn sources(&self, config: &SyncConfig) -> Vec<String> {
        if self.sources.is_empty() {
            config.sources.clone()
        } else {
            self.sources.clone()
        }
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Sync {
    type Error = SyncOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let sources = self.sources(&ctx.config.sync);
        if sources.is_empty() {
            return Err(SyncOpError::NoSources);
        }

        let session = Session::from_uris(&sources, self.bucket.as_str(), self.options(&ctx.config.sync));
        let events = session.events().subscribe();
        session.start();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let wait = session.wait();
        tokio::pin!(wait);
        let mut interrupted = false;

        let outcome = loop {
            tokio::select! {
                outcome = &mut wait => {
                    for event in events.drain() {
                        report(&session, &event);
                    }
                    break outcome;
                }
                Ok(event) = events.recv_async() => report(&session, &event),
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    tracing::warn!("interrupted, canceling sync");
                    session.cancel();
                }
            }
        };

        match outcome {
            Outcome::Done(path) => Ok(path.display().to_string()),
            Outcome::Failed(reason) => Err(SyncOpError::Failed(reason)),
            Outcome::Canceled => Err(SyncOpError::Canceled),
        }
    }
}

fn report(session: &Session, event: &Event) {
    let name = event.kind().as_str();
    match event {
        Event::ComposableStart { hash, source } => {
            tracing::debug!(event = name, %hash, %source, "fetching composable");
        }
        Event::ComposableDone { hash, source } => {
            tracing::debug!(
                event = name,
                %hash,
                source = source.as_deref().unwrap_or("local"),
                progress = session.progress(),
            );
        }
        Event::ComposableRetry {
            hash,
            source,
            remaining,
        } => {
            tracing::warn!(event = name, %hash, %source, remaining, "composable failed");
        }
        Event::CheckFailed(reason)
        | Event::DownloadFailed(reason)
        | Event::LinkFailed(reason)
        | Event::Failed(reason) => {
            tracing::error!(event = name, %reason);
        }
        Event::Done(path) => tracing::info!(event = name, path = %path.display()),
        _ => tracing::info!(event = name),
    }
}
