//! Tree reconstruction
//!
//! Turns a bucket's [`Node`] tree back into files on disk, reading file
//!  contents out of the local chunk store. The bucket is materialized at
//!  `{output}/{bucket}`.
//!
//! Files are assembled in dot-prefixed temp files inside the store
//!  directory and renamed into the tree once complete, so nothing but
//!  finished files ever appears below the bucket.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use crate::hash::{self, HashError, HashMode, NixHash};
use crate::index::{FileNode, Index, Node};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("bucket not found in index: {0}")]
    BucketNotFound(String),
    #[error("composable {0} is missing from the store")]
    MissingComposable(NixHash),
    #[error("hash mismatch for {}", .0.display())]
    HashMismatch(PathBuf),
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link hash error: {0}")]
    Hash(#[from] HashError),
}

#[derive(Debug, Clone)]
pub struct Linker {
    store: Store,
    check_file_hash: bool,
}

impl Linker {
    pub fn new(store: Store, check_file_hash: bool) -> Self {
        Self {
            store,
            check_file_hash,
        }
    }

    /// Materialize `bucket` below `output`, returning the bucket's path.
    ///  Paths that already exist are left alone.
    pub async fn link(&self, index: &Index, bucket: &str, output: &Path) -> Result<PathBuf, LinkError> {
        let root = index
            .bucket(bucket)
            .ok_or_else(|| LinkError::BucketNotFound(bucket.to_string()))?;
        let path = output.join(bucket);
        tokio::fs::create_dir_all(output).await?;
        self.link_node(root, path.clone(), index.hash_mode).await?;
        tracing::info!("linked {} to {}", bucket, path.display());
        Ok(path)
    }

    fn link_node<'a>(
        &'a self,
        node: &'a Node,
        path: PathBuf,
        mode: HashMode,
    ) -> BoxFuture<'a, Result<(), LinkError>> {
        Box::pin(async move {
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                tracing::debug!("{} exists, skipping", path.display());
                return Ok(());
            }

            match node {
                Node::Folder(folder) => {
                    tokio::fs::create_dir(&path).await?;
                    for child in &folder.files {
                        self.link_node(child, path.join(child.name()), mode).await?;
                    }
                }
                Node::File(file) => self.write_file(file, &path, mode).await?,
                Node::Symlink(link) => {
                    create_symlink(&link.target, &path).await?;
                    // permissions of the link itself are meaningless
                    return Ok(());
                }
            }

            if node.perm() != 0 {
                set_permissions(&path, node.perm()).await?;
            }
            Ok(())
        })
    }

    // concatenate chunks into a temp file in the store, then move it into place
    async fn write_file(&self, file: &FileNode, path: &Path, mode: HashMode) -> Result<(), LinkError> {
        // dropping the temp path deletes whatever was written so far
        let (output, partial) = tempfile::Builder::new()
            .prefix(".link-")
            .tempfile_in(self.store.root())?
            .into_parts();
        let mut output = tokio::fs::File::from_std(output);

        for hash in &file.composables {
            let mut chunk = match tokio::fs::File::open(self.store.path(hash)).await {
                Ok(chunk) => chunk,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(LinkError::MissingComposable(hash.clone()));
                }
                Err(e) => return Err(e.into()),
            };
            tokio::io::copy(&mut chunk, &mut output).await?;
        }
        output.flush().await?;
        drop(output);

        if self.check_file_hash && !hash::validate(&partial, &file.hash, mode).await? {
            return Err(LinkError::HashMismatch(path.to_path_buf()));
        }
        partial.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Whether `node` is already fully present at `path`: every node exists
///  with the right kind, and files have the right size
pub fn materialized<'a>(node: &'a Node, path: PathBuf) -> BoxFuture<'a, bool> {
    Box::pin(async move {
        let Ok(metadata) = tokio::fs::symlink_metadata(&path).await else {
            return false;
        };
        match node {
            Node::File(file) => metadata.is_file() && metadata.len() == file.size,
            Node::Symlink(_) => metadata.file_type().is_symlink(),
            Node::Folder(folder) => {
                if !metadata.is_dir() {
                    return false;
                }
                for child in &folder.files {
                    if !materialized(child, path.join(child.name())).await {
                        return false;
                    }
                }
                true
            }
        }
    })
}

#[cfg(unix)]
async fn create_symlink(target: &str, path: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, path).await
}

#[cfg(windows)]
async fn create_symlink(target: &str, path: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_file(target, path).await
}

#[cfg(unix)]
async fn set_permissions(path: &Path, perm: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(perm)).await
}

#[cfg(not(unix))]
async fn set_permissions(path: &Path, perm: u32) -> std::io::Result<()> {
    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_readonly(perm & 0o200 == 0);
    tokio::fs::set_permissions(path, permissions).await
}
