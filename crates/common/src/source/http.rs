use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{SourceError, Transport};
use crate::index::{Composable, Index};
use crate::store::STORE_DIR_NAME;
use crate::task::{TaskAdapter, TransferContext, TransferError};

/// A build output directory served over HTTP(S).
///  Index at `{base}/{index}`, chunks at `{base}/store/{hash}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base: String,
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_index(&self, name: &str) -> Result<Index, SourceError> {
        let url = format!("{}/{}", self.base, name);
        let response = self.client.get(&url).timeout(self.timeout).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SourceError::IndexNotFound(url));
        }
        let raw = response.error_for_status()?.bytes().await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn task(&self, composable: &Composable) -> Arc<dyn TaskAdapter> {
        Arc::new(HttpTask {
            client: self.client.clone(),
            url: format!("{}/{}/{}", self.base, STORE_DIR_NAME, composable.hash),
            timeout: self.timeout,
        })
    }
}

#[derive(Debug)]
struct HttpTask {
    client: Client,
    url: String,
    timeout: Duration,
}

#[async_trait]
impl TaskAdapter for HttpTask {
    async fn start(&self, ctx: &mut TransferContext) -> Result<(), TransferError> {
        let offset = ctx.progress.get();
        if offset > 0 && offset >= ctx.composable.size {
            // everything already landed before the last pause
            return Ok(());
        }

        let mut request = self.client.get(&self.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let mut response = tokio::select! {
            biased;
            _ = ctx.interrupted() => return Err(TransferError::Interrupted),
            response = tokio::time::timeout(self.timeout, request.send()) => {
                response.map_err(|_| TransferError::Timeout)??
            }
        };

        let mut output = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(false)
                    .open(&ctx.output)
                    .await?;
                file.set_len(offset).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                file
            }
            StatusCode::OK => {
                // the server ignored the range, start over
                if offset > 0 {
                    tracing::debug!("{} ignored range request, restarting", self.url);
                }
                ctx.progress.reset();
                tokio::fs::File::create(&ctx.output).await?
            }
            status => return Err(TransferError::Status(status.as_u16())),
        };

        loop {
            let chunk = tokio::select! {
                biased;
                _ = ctx.interrupted() => {
                    output.flush().await?;
                    return Err(TransferError::Interrupted);
                }
                chunk = tokio::time::timeout(self.timeout, response.chunk()) => {
                    chunk.map_err(|_| TransferError::Timeout)??
                }
            };
            let Some(bytes) = chunk else {
                break;
            };
            output.write_all(&bytes).await?;
            ctx.progress.add(bytes.len() as u64);
        }
        output.flush().await?;
        Ok(())
    }
}
