//! Flat content-addressed chunk store
//!
//! One file per composable, named by its nix hash:
//! `{root}/{hash}`. The same layout is used for a builder's output
//! and for a resolver's local cache; they just live in different trees.
//! Dot-prefixed names are never chunks; the linker keeps its temp files there.

use std::path::{Path, PathBuf};

use crate::hash::{self, HashError, HashMode, NixHash};

/// Directory name of a store below a build or output root
pub const STORE_DIR_NAME: &str = "store";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store hash error: {0}")]
    Hash(#[from] HashError),
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    hash_mode: HashMode,
}

impl Store {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl AsRef<Path>, hash_mode: HashMode) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!("opened store at {}", root.display());
        Ok(Self { root, hash_mode })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_mode(&self) -> HashMode {
        self.hash_mode
    }

    pub fn path(&self, hash: &NixHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    pub async fn contains(&self, hash: &NixHash) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path(hash)).await?)
    }

    /// Re-hash the stored chunk. A missing or partial chunk does not validate.
    pub async fn validate(&self, hash: &NixHash) -> Result<bool, StoreError> {
        Ok(hash::validate(&self.path(hash), hash, self.hash_mode).await?)
    }

    /// Write `data` under `hash` unless it is already present.
    ///  Returns whether anything was written.
    pub async fn put_if_absent(&self, hash: &NixHash, data: &[u8]) -> Result<bool, StoreError> {
        if self.contains(hash).await? {
            return Ok(false);
        }
        tokio::fs::write(self.path(hash), data).await?;
        Ok(true)
    }

    /// Delete a (possibly partial) chunk. Missing files are fine.
    pub async fn remove(&self, hash: &NixHash) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
