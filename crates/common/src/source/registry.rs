use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use regex::Regex;
use reqwest::{Client, StatusCode};
use url::Url;

use super::{SourceError, Transport};
use crate::index::{Composable, Index};
use crate::task::{TaskAdapter, TransferContext, TransferError};

pub const DEFAULT_NPM_REGISTRY: &str = "https://registry.npmjs.com";
/// Largest index document accepted out of a tarball
pub const MAX_INDEX_SIZE: u64 = 64 * 1024 * 1024;

/**
 * Registry sources
 * ================
 * A package registry used as a dumb chunk host. Every composable is
 *  published as its own version of one package:
 *   `{registry}/{fullname}/-/{pkg}-0.0.0-{hash}.tgz`
 *  holding a single entry `package/{hash}`.
 * The index rides along in versions named `0.0.0-latest-{n}`; the
 *  highest `n` wins.
 * `npm://org/pkg` means `@org/pkg` on the public npm registry,
 *  `npm://pkg` means the unscoped `pkg`. Any other scheme has to say
 *  where its registry lives with `?registry=`.
 */
#[derive(Debug, Clone)]
pub struct RegistryTransport {
    registry: String,
    fullname: String,
    pkgname: String,
    client: Client,
    timeout: Duration,
}

impl RegistryTransport {
    pub fn new(
        registry: &str,
        fullname: impl Into<String>,
        pkgname: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            registry: registry.trim_end_matches('/').to_string(),
            fullname: fullname.into(),
            pkgname: pkgname.into(),
            client,
            timeout,
        })
    }

    pub fn from_url(url: &Url, timeout: Duration) -> Result<Self, SourceError> {
        let org = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| SourceError::InvalidUri(url.to_string(), "missing package".to_string()))?;
        let path = url.path().trim_matches('/');
        let (fullname, pkgname) = if path.is_empty() {
            (org.to_string(), org.to_string())
        } else {
            (format!("@{}/{}", org, path), path.to_string())
        };

        let registry = match url.query_pairs().find(|(key, _)| key == "registry") {
            Some((_, registry)) => registry.into_owned(),
            None if url.scheme() == "npm" => DEFAULT_NPM_REGISTRY.to_string(),
            None => return Err(SourceError::MissingRegistry(url.to_string())),
        };
        Self::new(&registry, fullname, pkgname, timeout)
    }

    fn tarball_url(&self, version: &str) -> String {
        format!(
            "{}/{}/-/{}-{}.tgz",
            self.registry, self.fullname, self.pkgname, version
        )
    }

    async fn latest_index_version(&self) -> Result<String, SourceError> {
        let url = format!("{}/{}", self.registry, self.fullname);
        let response = self.client.get(&url).timeout(self.timeout).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SourceError::IndexNotFound(url));
        }
        let document: serde_json::Value = response.error_for_status()?.json().await?;
        let versions = document
            .get("versions")
            .and_then(|versions| versions.as_object())
            .map(|versions| versions.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        newest_index_version(versions.iter().map(String::as_str))
            .map(str::to_string)
            .ok_or(SourceError::IndexNotFound(url))
    }
}

#[async_trait]
impl Transport for RegistryTransport {
    async fn fetch_index(&self, name: &str) -> Result<Index, SourceError> {
        let version = self.latest_index_version().await?;
        tracing::debug!("using index version {} of {}", version, self.fullname);

        let archive = self
            .client
            .get(self.tarball_url(&version))
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let entry = format!("package/{}", name);
        let raw = tokio::task::spawn_blocking(move || extract_entry(&archive, &entry, MAX_INDEX_SIZE))
            .await
            .map_err(|e| TransferError::Aborted(e.to_string()))??;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn task(&self, composable: &Composable) -> Arc<dyn TaskAdapter> {
        Arc::new(RegistryTask {
            client: self.client.clone(),
            url: self.tarball_url(&format!("0.0.0-{}", composable.hash)),
            entry: format!("package/{}", composable.hash),
            size: composable.size,
            timeout: self.timeout,
        })
    }
}

/// Pick the highest `0.0.0-latest-{n}` from a list of versions
pub fn newest_index_version<'a, I>(versions: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    // the pattern is a literal
    let pattern = Regex::new(r"^0\.0\.0-latest-(\d+)$").ok()?;
    versions
        .into_iter()
        .filter_map(|version| {
            let n: u64 = pattern.captures(version)?.get(1)?.as_str().parse().ok()?;
            Some((n, version))
        })
        .max_by_key(|(n, _)| *n)
        .map(|(_, version)| version)
}

/// Pull a single entry of at most `limit` bytes out of a `.tgz`
pub fn extract_entry(archive: &[u8], name: &str, limit: u64) -> Result<Vec<u8>, TransferError> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.path()? != Path::new(name) {
            continue;
        }
        if entry.size() > limit {
            return Err(TransferError::Archive(format!(
                "{} is {} bytes, expected at most {}",
                name,
                entry.size(),
                limit
            )));
        }
        // the header size is not trusted for allocation
        let mut data = Vec::new();
        entry.take(limit).read_to_end(&mut data)?;
        return Ok(data);
    }
    Err(TransferError::EntryNotFound(name.to_string()))
}

// tarballs can't be resumed: every attempt downloads the whole archive
#[derive(Debug)]
struct RegistryTask {
    client: Client,
    url: String,
    entry: String,
    size: u64,
    timeout: Duration,
}

#[async_trait]
impl TaskAdapter for RegistryTask {
    async fn start(&self, ctx: &mut TransferContext) -> Result<(), TransferError> {
        ctx.progress.reset();

        let mut response = tokio::select! {
            biased;
            _ = ctx.interrupted() => return Err(TransferError::Interrupted),
            response = tokio::time::timeout(self.timeout, self.client.get(&self.url).send()) => {
                response.map_err(|_| TransferError::Timeout)??
            }
        };
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }

        let mut archive = Vec::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = ctx.interrupted() => return Err(TransferError::Interrupted),
                chunk = tokio::time::timeout(self.timeout, response.chunk()) => {
                    chunk.map_err(|_| TransferError::Timeout)??
                }
            };
            match chunk {
                Some(bytes) => archive.extend_from_slice(&bytes),
                None => break,
            }
        }

        let (entry, size) = (self.entry.clone(), self.size);
        let data = tokio::task::spawn_blocking(move || extract_entry(&archive, &entry, size))
            .await
            .map_err(|e| TransferError::Aborted(e.to_string()))??;

        tokio::fs::write(&ctx.output, &data).await?;
        ctx.progress.add(data.len() as u64);
        Ok(())
    }
}
