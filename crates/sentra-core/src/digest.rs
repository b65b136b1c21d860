//! Streaming file digests.
//!
//! All three algorithms the signature catalog indexes (MD5, SHA-1, SHA-256)
//! are computed in one pass over the file, reading fixed 16 KiB blocks.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::CoreError;
use crate::Result;

const BLOCK_SIZE: usize = 16 * 1024;

/// Digest algorithms understood by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Lowercase token used in catalog rows (`whitelist.hash_type`).
    pub fn lower(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Uppercase token used in `ScanResult::matched_hash_type`.
    pub fn upper(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// Parse either casing; anything else is `UnsupportedAlgorithm`.
    pub fn parse(token: &str) -> Result<Self> {
        match token.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(CoreError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// The triple of optional hex digests for one file.
///
/// Each entry is independently optional: a failure in one algorithm does not
/// poison the others, although in practice all three come from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestSet {
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
}

impl DigestSet {
    pub fn get(&self, algorithm: DigestAlgorithm) -> Option<&str> {
        match algorithm {
            DigestAlgorithm::Md5 => self.md5.as_deref(),
            DigestAlgorithm::Sha1 => self.sha1.as_deref(),
            DigestAlgorithm::Sha256 => self.sha256.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.md5.is_none() && self.sha1.is_none() && self.sha256.is_none()
    }
}

/// Compute a single digest of `path` as a lowercase hex string.
pub fn compute(path: &Path, algorithm: DigestAlgorithm) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(BLOCK_SIZE, file);
    let mut buf = vec![0u8; BLOCK_SIZE];

    match algorithm {
        DigestAlgorithm::Md5 => stream_into(&mut reader, &mut buf, Md5::new()),
        DigestAlgorithm::Sha1 => stream_into(&mut reader, &mut buf, Sha1::new()),
        DigestAlgorithm::Sha256 => stream_into(&mut reader, &mut buf, Sha256::new()),
    }
}

/// Compute all three digests in one pass over the file.
pub fn compute_all(path: &Path) -> Result<DigestSet> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(BLOCK_SIZE, file);
    let mut buf = vec![0u8; BLOCK_SIZE];

    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha1.update(&buf[..n]);
        sha256.update(&buf[..n]);
    }

    Ok(DigestSet {
        md5: Some(hex::encode(md5.finalize())),
        sha1: Some(hex::encode(sha1.finalize())),
        sha256: Some(hex::encode(sha256.finalize())),
    })
}

fn stream_into<R: Read, D: Digest>(reader: &mut R, buf: &mut [u8], mut digest: D) -> Result<String> {
    loop {
        let n = reader.read(buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(hex::encode(digest.finalize()))
}
