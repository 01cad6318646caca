use serde::{Deserialize, Serialize};

use crate::hash::NixHash;

/**
 * Nodes
 * =====
 * A bucket is a strictly acyclic tree of nodes, each one owned by
 *  its parent. Every node carries the content hash of its subtree,
 *  computed once at build time:
 *  - File: hash of the file content, plus the ordered list of chunk
 *     hashes needed to rebuild it (repeats allowed)
 *  - Folder: hash of its children's hashes, sorted
 *  - Symlink: hash of the link target
 * On the wire a node is a JSON object tagged by `type`.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    File(FileNode),
    Folder(FolderNode),
    Symlink(SymlinkNode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub hash: NixHash,
    pub size: u64,
    pub perm: u32,
    pub composables: Vec<NixHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderNode {
    pub name: String,
    pub hash: NixHash,
    pub size: u64,
    pub perm: u32,
    pub files: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkNode {
    pub name: String,
    pub hash: NixHash,
    pub size: u64,
    pub perm: u32,
    pub target: String,
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::File(file) => &file.name,
            Node::Folder(folder) => &folder.name,
            Node::Symlink(link) => &link.name,
        }
    }

    pub fn hash(&self) -> &NixHash {
        match self {
            Node::File(file) => &file.hash,
            Node::Folder(folder) => &folder.hash,
            Node::Symlink(link) => &link.hash,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Node::File(file) => file.size,
            Node::Folder(folder) => folder.size,
            Node::Symlink(link) => link.size,
        }
    }

    pub fn perm(&self) -> u32 {
        match self {
            Node::File(file) => file.perm,
            Node::Folder(folder) => folder.perm,
            Node::Symlink(link) => link.perm,
        }
    }

    /// Pre-order traversal over this node and every descendant
    pub fn visit<'a, F>(&'a self, f: &mut F)
    where
        F: FnMut(&'a Node),
    {
        f(self);
        if let Node::Folder(folder) = self {
            for child in &folder.files {
                child.visit(f);
            }
        }
    }
}
