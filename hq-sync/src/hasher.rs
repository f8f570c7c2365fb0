//! Streaming file hasher
//!
//! Reads files in 64 KiB chunks so arbitrarily large files never load
//! into memory. I/O failures surface to the caller: the uploader treats a
//! failed hash as "treat file as new", the conflict check skips the path.

use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::config::HashAlgorithm;
use crate::error::Result;

const CHUNK_SIZE: usize = 64 * 1024;

/// Content digest of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub hash: String,
    pub algorithm: HashAlgorithm,
    pub size_bytes: u64,
}

/// Incrementally fed digest, for callers that already hold the data
/// stream (the downloader hashes while writing).
pub enum IncrementalHasher {
    Sha256(Sha256),
    Sha1(Sha1),
}

impl IncrementalHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash a file's content, streaming.
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<FileDigest> {
    let mut file = File::open(path).await?;
    let mut hasher = IncrementalHasher::new(algorithm);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut size_bytes = 0u64;

    loop {
        let count = file.read(&mut buffer).await?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
        size_bytes += count as u64;
    }

    Ok(FileDigest {
        hash: hasher.finalize(),
        algorithm,
        size_bytes,
    })
}

/// Hash an in-memory buffer with the same encoding as [`hash_file`].
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> String {
    let mut hasher = IncrementalHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}
