//! Content addressing
//!
//! Every identity in a Nereid index (chunks, files, folders, symlinks) is a
//! *nix hash*: a SHA-256 digest folded into a Nix-store compatible path hash.
//!
//! ```text
//! sha256(content) --hex--> "source:sha256:<hex>:/nereid/store"
//!                  --sha256--> 32 bytes --xor-fold--> 20 bytes --base32--> 32 chars
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Nix base-32 alphabet (no `e`, `o`, `u`, `t`)
pub const NIX_BASE32_ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Length of the folded digest in bytes
pub const NIX_HASH_SIZE: usize = 20;

/// Length of an encoded nix hash in characters
pub const NIX_HASH_LEN: usize = 32;

const STORE_PREFIX: &str = "source:sha256:";
const STORE_SUFFIX: &str = ":/nereid/store";

// files are streamed through the hasher in blocks of this size
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("unsupported hash mode: {0}")]
    UnsupportedHashMode(String),
    #[error("hash i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hashing scheme recorded in an index.
///  Only the nix scheme exists today; anything else read
///  from disk is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HashMode {
    #[default]
    Nix,
}

impl HashMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashMode::Nix => "nix",
        }
    }
}

impl FromStr for HashMode {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nix" => Ok(HashMode::Nix),
            other => Err(HashError::UnsupportedHashMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for HashMode {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HashMode> for String {
    fn from(mode: HashMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for HashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A base-32 encoded nix hash. Used as the key of every
///  content-addressed object: store entries, nodes and composables.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NixHash(String);

impl NixHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NixHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NixHash {
    fn from(s: &str) -> Self {
        NixHash(s.to_string())
    }
}

impl From<String> for NixHash {
    fn from(s: String) -> Self {
        NixHash(s)
    }
}

impl AsRef<str> for NixHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Encode bytes with the nix base-32 encoding.
///
/// Nix assembles each 5-bit group starting from the most significant
///  bit position of the input and walks down to the least significant,
///  so the first character encodes the *last* bits of the buffer.
pub fn nix_base32(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let len = (bytes.len() * 8 - 1) / 5 + 1;
    let mut out = String::with_capacity(len);
    for n in (0..len).rev() {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        let low = (bytes[i] as u16) >> j;
        let high = if i + 1 < bytes.len() {
            (bytes[i + 1] as u16) << (8 - j)
        } else {
            0
        };
        out.push(NIX_BASE32_ALPHABET[((low | high) & 0x1f) as usize] as char);
    }
    out
}

/// Fold a SHA-256 digest into a nix hash.
pub fn nix_hash(digest: &[u8; 32]) -> NixHash {
    let descriptor = format!("{}{}{}", STORE_PREFIX, hex::encode(digest), STORE_SUFFIX);
    let outer = Sha256::digest(descriptor.as_bytes());

    let mut truncation = [0u8; NIX_HASH_SIZE];
    for (i, byte) in outer.iter().enumerate() {
        truncation[i % NIX_HASH_SIZE] ^= byte;
    }
    NixHash(nix_base32(&truncation))
}

/// Hash an in-memory buffer (a chunk, or a folder's joined child hashes)
pub fn hash_bytes(data: &[u8], mode: HashMode) -> NixHash {
    match mode {
        HashMode::Nix => nix_hash(&Sha256::digest(data).into()),
    }
}

/// Hash a folder from its children's hashes. Children are sorted first,
///  so the result does not depend on directory iteration order.
pub fn hash_children<'a, I>(children: I, mode: HashMode) -> NixHash
where
    I: IntoIterator<Item = &'a NixHash>,
{
    let mut hashes: Vec<&str> = children.into_iter().map(NixHash::as_str).collect();
    hashes.sort_unstable();
    hash_bytes(hashes.concat().as_bytes(), mode)
}

/// Stream a file through the hasher without loading it into memory
pub async fn hash_file(path: &Path, mode: HashMode) -> Result<NixHash, HashError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    match mode {
        HashMode::Nix => Ok(nix_hash(&hasher.finalize().into())),
    }
}

/// Check whether the file at `path` hashes to `expected`.
///  A missing file is not an error, it just doesn't validate.
pub async fn validate(path: &Path, expected: &NixHash, mode: HashMode) -> Result<bool, HashError> {
    match hash_file(path, mode).await {
        Ok(actual) => Ok(&actual == expected),
        Err(HashError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
