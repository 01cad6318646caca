//! Builder
//!
//! Walks a source tree, splits every file into fixed-size chunks, writes
//! each chunk once into the shared store and emits an [`Index`] with one
//! bucket named after the top directory.
//!
//! ```text
//! {dst}/nereid.json       the index
//! {dst}/store/{hash}      one file per distinct chunk
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::hash::{self, HashError, HashMode, NixHash};
use crate::index::{Composable, FileNode, FolderNode, Index, Node, SymlinkNode, DEFAULT_INDEX_NAME};
use crate::store::{Store, StoreError, STORE_DIR_NAME};

/// 10 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub hash_mode: HashMode,
    pub chunk_size: usize,
    /// File name of the emitted index, relative to the build root
    pub index: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            hash_mode: HashMode::Nix,
            chunk_size: DEFAULT_CHUNK_SIZE,
            index: DEFAULT_INDEX_NAME.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unsupported file type: {0}")]
    UnsupportedEntryType(PathBuf),
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("invalid source path: {0}")]
    InvalidSource(PathBuf),
    #[error("hash error: {0}")]
    Hash(#[from] HashError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode index: {0}")]
    Json(#[from] serde_json::Error),
}

// composables in discovery order, each recorded once
#[derive(Default)]
struct Discovered {
    composables: Vec<Composable>,
    seen: HashSet<NixHash>,
}

impl Discovered {
    fn record(&mut self, hash: &NixHash, size: u64) {
        if self.seen.insert(hash.clone()) {
            self.composables.push(Composable::new(hash.clone(), size));
        }
    }
}

/// Build `src` into `dst`, returning the index that was written
pub async fn build(src: &Path, dst: &Path, options: &BuildOptions) -> Result<Index, BuildError> {
    if options.chunk_size == 0 {
        return Err(BuildError::InvalidChunkSize);
    }
    let bucket = src
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| BuildError::InvalidSource(src.to_path_buf()))?;

    tracing::info!("building {} into {}", src.display(), dst.display());

    let store = Store::open(dst.join(STORE_DIR_NAME), options.hash_mode).await?;
    let mut discovered = Discovered::default();
    let root = build_tree(src.to_path_buf(), &store, &mut discovered, options).await?;

    let mut index = Index::new(options.hash_mode);
    index.buckets.insert(bucket.clone(), root);
    index.composables = discovered.composables;

    let encoded = serde_json::to_vec(&index)?;
    tokio::fs::write(dst.join(&options.index), encoded).await?;

    tracing::info!(
        "built bucket {} with {} composables",
        bucket,
        index.composables.len()
    );
    Ok(index)
}

fn build_tree<'a>(
    path: PathBuf,
    store: &'a Store,
    discovered: &'a mut Discovered,
    options: &'a BuildOptions,
) -> BoxFuture<'a, Result<Node, BuildError>> {
    Box::pin(async move {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata = tokio::fs::symlink_metadata(&path).await?;
        let perm = permissions(&metadata);
        let file_type = metadata.file_type();

        if file_type.is_file() {
            let (hash, size, composables) = build_composables(&path, store, discovered, options).await?;
            tracing::debug!("file {} -> {} ({} chunks)", path.display(), hash, composables.len());
            Ok(Node::File(FileNode {
                name,
                hash,
                size,
                perm,
                composables,
            }))
        } else if file_type.is_dir() {
            let mut entries = tokio::fs::read_dir(&path).await?;
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name());
            }
            // sorted so the same tree always yields the same index
            names.sort();

            let mut files = Vec::with_capacity(names.len());
            for child in names {
                files.push(build_tree(path.join(child), store, discovered, options).await?);
            }
            let hash = hash::hash_children(files.iter().map(Node::hash), options.hash_mode);
            let size = files.iter().map(Node::size).sum();
            Ok(Node::Folder(FolderNode {
                name,
                hash,
                size,
                perm,
                files,
            }))
        } else if file_type.is_symlink() {
            let target = tokio::fs::read_link(&path)
                .await?
                .to_string_lossy()
                .into_owned();
            let hash = hash::hash_bytes(target.as_bytes(), options.hash_mode);
            Ok(Node::Symlink(SymlinkNode {
                name,
                hash,
                size: 0,
                perm,
                target,
            }))
        } else {
            Err(BuildError::UnsupportedEntryType(path))
        }
    })
}

// Splits a file into chunks in a single pass, hashing the whole file
//  alongside. Returns (file hash, file size, ordered chunk hashes).
async fn build_composables(
    path: &Path,
    store: &Store,
    discovered: &mut Discovered,
    options: &BuildOptions,
) -> Result<(NixHash, u64, Vec<NixHash>), BuildError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut whole = Sha256::new();
    let mut buffer = vec![0u8; options.chunk_size];
    let mut composables = Vec::new();
    let mut size = 0u64;

    loop {
        let filled = read_full(&mut file, &mut buffer).await?;
        // an empty file still gets one (empty) chunk
        if filled == 0 && !composables.is_empty() {
            break;
        }
        let chunk = &buffer[..filled];
        whole.update(chunk);
        size += filled as u64;

        let hash = hash::hash_bytes(chunk, options.hash_mode);
        if store.put_if_absent(&hash, chunk).await? {
            tracing::debug!("stored chunk {} ({} bytes)", hash, filled);
        }
        discovered.record(&hash, filled as u64);
        composables.push(hash);

        if filled < buffer.len() {
            break;
        }
    }

    let file_hash = match options.hash_mode {
        HashMode::Nix => hash::nix_hash(&whole.finalize().into()),
    };
    Ok((file_hash, size, composables))
}

async fn read_full(file: &mut tokio::fs::File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(unix)]
fn permissions(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_chunks(chunk_size: usize) -> BuildOptions {
        BuildOptions {
            chunk_size,
            ..BuildOptions::default()
        }
    }

    async fn write(path: &Path, data: &[u8]) {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, data).await.unwrap();
    }

    #[tokio::test]
    async fn test_build_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("pkg");
        write(&src.join("a.txt"), b"alpha alpha alpha").await;
        write(&src.join("nested/b.txt"), b"bravo").await;
        write(&src.join("nested/deeper/c.bin"), &[7u8; 100]).await;

        let first = temp.path().join("out1");
        let second = temp.path().join("out2");
        build(&src, &first, &small_chunks(8)).await.unwrap();
        build(&src, &second, &small_chunks(8)).await.unwrap();

        let one = tokio::fs::read(first.join(DEFAULT_INDEX_NAME)).await.unwrap();
        let two = tokio::fs::read(second.join(DEFAULT_INDEX_NAME)).await.unwrap();
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn test_chunking_and_dedup() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("pkg");
        // three identical 4-byte chunks and a 2-byte tail
        write(&src.join("repeat"), b"abcdabcdabcdxy").await;

        let dst = temp.path().join("out");
        let index = build(&src, &dst, &small_chunks(4)).await.unwrap();

        let root = index.bucket("pkg").unwrap();
        let Node::Folder(folder) = root else {
            panic!("expected folder root");
        };
        let Node::File(file) = &folder.files[0] else {
            panic!("expected file");
        };
        assert_eq!(file.size, 14);
        assert_eq!(file.composables.len(), 4);
        assert_eq!(file.composables[0], file.composables[1]);
        assert_eq!(file.composables[1], file.composables[2]);
        assert_eq!(file.hash, hash::hash_bytes(b"abcdabcdabcdxy", HashMode::Nix));

        // storage is deduplicated, the reference list is not
        assert_eq!(index.composables.len(), 2);
        let mut stored = tokio::fs::read_dir(dst.join(STORE_DIR_NAME)).await.unwrap();
        let mut count = 0;
        while stored.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_chunk_boundaries() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("pkg");
        write(&src.join("empty"), b"").await;
        write(&src.join("exact"), b"12345678").await;
        write(&src.join("past"), b"123456789").await;

        let index = build(&src, &temp.path().join("out"), &small_chunks(8))
            .await
            .unwrap();
        let Node::Folder(folder) = index.bucket("pkg").unwrap() else {
            panic!("expected folder root");
        };
        let chunks = |name: &str| {
            folder
                .files
                .iter()
                .find_map(|node| match node {
                    Node::File(file) if file.name == name => Some(file.composables.len()),
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(chunks("empty"), 1);
        assert_eq!(chunks("exact"), 1);
        assert_eq!(chunks("past"), 2);

        let empty_hash = hash::hash_bytes(b"", HashMode::Nix);
        assert!(index
            .composables
            .iter()
            .any(|c| c.hash == empty_hash && c.size == 0));
    }

    #[tokio::test]
    async fn test_folder_hash_and_size() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("pkg");
        write(&src.join("x"), b"xx").await;
        write(&src.join("y"), b"yyy").await;

        let index = build(&src, &temp.path().join("out"), &BuildOptions::default())
            .await
            .unwrap();
        let root = index.bucket("pkg").unwrap();
        assert_eq!(root.size(), 5);

        let x = hash::hash_bytes(b"xx", HashMode::Nix);
        let y = hash::hash_bytes(b"yyy", HashMode::Nix);
        assert_eq!(root.hash(), &hash::hash_children([&y, &x], HashMode::Nix));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_and_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let src = temp.path().join("pkg");
        write(&src.join("run.sh"), b"#!/bin/sh\n").await;
        std::fs::set_permissions(src.join("run.sh"), std::fs::Permissions::from_mode(0o755))
            .unwrap();
        std::os::unix::fs::symlink("run.sh", src.join("alias")).unwrap();

        let index = build(&src, &temp.path().join("out"), &BuildOptions::default())
            .await
            .unwrap();
        let Node::Folder(folder) = index.bucket("pkg").unwrap() else {
            panic!("expected folder root");
        };
        let link = folder.files.iter().find(|n| n.name() == "alias").unwrap();
        assert!(matches!(link, Node::Symlink(s) if s.target == "run.sh"));
        let script = folder.files.iter().find(|n| n.name() == "run.sh").unwrap();
        assert_eq!(script.perm(), 0o755);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unsupported_entry_type() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("pkg");
        tokio::fs::create_dir_all(&src).await.unwrap();
        let _listener = std::os::unix::net::UnixListener::bind(src.join("sock")).unwrap();

        let err = build(&src, &temp.path().join("out"), &BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedEntryType(path) if path.ends_with("sock")));
    }
}
