//! Whole content and per part hashing
//!
//! The whole content hash (SHA-512) is attached to an uploaded object as
//! immutable metadata and checked again after a download. It is the last
//! line of defense against silent corruption, independent of any checksums
//! the transport protocol itself may use. Per part hashes (SHA-256) are
//! attached to individual part uploads for server side verification.
use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256, Sha512};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::errors::TransferError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// The SHA-512 digest of an object's complete content as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wraps an already encoded digest, e.g. one read back from remote metadata
    pub fn from_hex<T: Into<String>>(hex: T) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The SHA-256 digest of a single part as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartHash(String);

impl PartHash {
    pub fn from_hex<T: Into<String>>(hex: T) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashes the complete content given as a slice
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    ContentHash(encode_hex(&hasher.finalize()))
}

/// Hashes the content of a single part
pub fn part_hash(bytes: &[u8]) -> PartHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    PartHash(encode_hex(&hasher.finalize()))
}

/// Hashes the complete content of a file by streaming it once
pub async fn hash_file<P: AsRef<Path>>(path: P) -> Result<ContentHash, TransferError> {
    let mut file = File::open(path.as_ref()).await?;
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n_read = file.read(&mut buffer).await?;
        if n_read == 0 {
            break;
        }
        hasher.update(&buffer[..n_read]);
    }

    Ok(hasher.finish())
}

/// Incrementally hashes content which arrives in chunks
pub struct StreamingHasher {
    inner: Sha512,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha512::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(encode_hex(&self.inner.finalize()))
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
