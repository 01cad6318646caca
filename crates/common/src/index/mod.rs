//! Index and tree model
//!
//! An [`Index`] is the single JSON document a builder emits and a source serves:
//!
//! ```text
//! Index { version: 1, hashMode: "nix" }
//!   |-- buckets: name -> root Node (File | Folder | Symlink)
//!   |-- composables: every chunk discovered at build time ({hash, size})
//!   `-- data: optional opaque payload
//! ```
//!
//! The [closure](Index::closure) of a bucket is the exact set of composables
//! a resolver has to hold locally before the bucket can be linked.

mod node;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::hash::{HashMode, NixHash};

pub use node::{FileNode, FolderNode, Node, SymlinkNode};

/// Current index format version
pub const INDEX_VERSION: u32 = 1;

/// Default file name of an index, relative to a source root
pub const DEFAULT_INDEX_NAME: &str = "nereid.json";

/// An immutable content chunk: the unit of transfer and storage.
///  Identity is the hash; `retry` is only meaningful on the
///  resolve side and never leaves the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composable {
    pub hash: NixHash,
    pub size: u64,
    #[serde(skip)]
    pub retry: u32,
}

impl Composable {
    pub fn new(hash: NixHash, size: u64) -> Self {
        Self {
            hash,
            size,
            retry: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClosureError {
    #[error("bucket not found in index: {0}")]
    BucketNotFound(String),
    #[error("bucket root {actual} does not match pinned hash {expected}")]
    PinMismatch { expected: NixHash, actual: NixHash },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub version: u32,
    pub hash_mode: HashMode,
    pub buckets: BTreeMap<String, Node>,
    pub composables: Vec<Composable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Index {
    pub fn new(hash_mode: HashMode) -> Self {
        Self {
            version: INDEX_VERSION,
            hash_mode,
            buckets: BTreeMap::new(),
            composables: Vec::new(),
            data: None,
        }
    }

    pub fn bucket(&self, name: &str) -> Option<&Node> {
        self.buckets.get(name)
    }

    /// Compute the set of composables needed to materialize `bucket`.
    ///
    /// When `pin` is given the bucket's root hash must equal it, otherwise
    ///  this index is not the version the caller asked for. Every returned
    ///  composable carries a fresh `retry` budget.
    pub fn closure(
        &self,
        bucket: &str,
        pin: Option<&NixHash>,
        retry: u32,
    ) -> Result<Vec<Composable>, ClosureError> {
        let root = self
            .bucket(bucket)
            .ok_or_else(|| ClosureError::BucketNotFound(bucket.to_string()))?;

        if let Some(expected) = pin {
            if root.hash() != expected {
                return Err(ClosureError::PinMismatch {
                    expected: expected.clone(),
                    actual: root.hash().clone(),
                });
            }
        }

        let mut reachable = HashSet::new();
        root.visit(&mut |node| {
            if let Node::File(file) = node {
                reachable.extend(file.composables.iter());
            }
        });

        Ok(self
            .composables
            .iter()
            .filter(|composable| reachable.contains(&composable.hash))
            .map(|composable| Composable {
                retry,
                ..composable.clone()
            })
            .collect())
    }
}
