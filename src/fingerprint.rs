//! Size-tiered file identity.
//!
//! The fingerprint is the resumability key: it matches a local file to its
//! persisted upload record. Hashing cost must not dominate upload cost, so
//! the strategy degrades from full-content hashing to metadata-only as the
//! file grows. Every result carries its strategy tag so digests from
//! different strategies are never conflated.

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use md5::Md5;
use sha2::{Digest, Sha256};

/// Tier thresholds. These are policy, not protocol, so callers may tune them.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintPolicy {
    /// Files up to this size get a full-content hash.
    pub full_tier_max: u64,
    /// Files up to this size get a head hash combined with metadata.
    pub hybrid_tier_max: u64,
    /// How much of the file head the hybrid tier reads.
    pub hybrid_head_len: u64,
}

impl Default for FingerprintPolicy {
    fn default() -> Self {
        Self {
            full_tier_max: 50 * 1024 * 1024,
            hybrid_tier_max: 500 * 1024 * 1024,
            hybrid_head_len: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// SHA-256 of the entire content.
    Full,
    /// SHA-256 of the head folded with (size, mtime) through a fast hash.
    Hybrid,
    /// Fast hash of (path, size, mtime); no content read.
    Meta,
    /// Fast hash of the path alone; degraded fallback when the file cannot
    /// be read or stat'd.
    Path,
}

impl Strategy {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Hybrid => "hybrid",
            Self::Meta => "meta",
            Self::Path => "path",
        }
    }
}

/// Tagged file identity. Two fingerprints are equal only if both strategy
/// and digest match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub strategy: Strategy,
    pub digest: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.strategy.tag(), self.digest)
    }
}

/// Pick the strategy for a file of the given size. Pure so tier boundaries
/// are testable without multi-hundred-MiB fixtures.
pub fn tier_for_size(policy: &FingerprintPolicy, size: u64) -> Strategy {
    if size <= policy.full_tier_max {
        Strategy::Full
    } else if size <= policy.hybrid_tier_max {
        Strategy::Hybrid
    } else {
        Strategy::Meta
    }
}

/// Fingerprint a file with the default policy.
pub fn fingerprint(path: &Path) -> Fingerprint {
    fingerprint_with(path, &FingerprintPolicy::default())
}

/// Fingerprint a file. Never fails: read errors step down one tier at a
/// time, and a stat failure falls back to hashing the path alone.
pub fn fingerprint_with(path: &Path, policy: &FingerprintPolicy) -> Fingerprint {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return path_fingerprint(path),
    };
    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    match tier_for_size(policy, size) {
        Strategy::Full => content_fingerprint(path)
            .or_else(|| hybrid_fingerprint(path, policy, size, mtime))
            .unwrap_or_else(|| meta_fingerprint(path, size, mtime)),
        Strategy::Hybrid => hybrid_fingerprint(path, policy, size, mtime)
            .unwrap_or_else(|| meta_fingerprint(path, size, mtime)),
        Strategy::Meta => meta_fingerprint(path, size, mtime),
        Strategy::Path => path_fingerprint(path),
    }
}

/// Digest of the path alone, with no strategy tag. Matches the record
/// naming written before tiered fingerprints existed; used for
/// discovery-only backward compatibility, never written by new code.
pub fn legacy_digest(path: &Path) -> String {
    hex::encode(Md5::digest(path.to_string_lossy().as_bytes()))
}

fn content_fingerprint(path: &Path) -> Option<Fingerprint> {
    let mut file = fs::File::open(path).ok()?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Some(Fingerprint {
        strategy: Strategy::Full,
        digest: hex::encode(hasher.finalize()),
    })
}

fn hybrid_fingerprint(
    path: &Path,
    policy: &FingerprintPolicy,
    size: u64,
    mtime: u64,
) -> Option<Fingerprint> {
    let mut file = fs::File::open(path).ok()?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = policy.hybrid_head_len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    let head = hex::encode(hasher.finalize());

    // Fold size and mtime in through a fast secondary hash.
    let mut combined = Md5::new();
    combined.update(head.as_bytes());
    combined.update(format!("_{size}_{mtime}").as_bytes());
    Some(Fingerprint {
        strategy: Strategy::Hybrid,
        digest: hex::encode(combined.finalize()),
    })
}

fn meta_fingerprint(path: &Path, size: u64, mtime: u64) -> Fingerprint {
    let mut hasher = Md5::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(format!("|{size}|{mtime}").as_bytes());
    Fingerprint {
        strategy: Strategy::Meta,
        digest: hex::encode(hasher.finalize()),
    }
}

fn path_fingerprint(path: &Path) -> Fingerprint {
    Fingerprint {
        strategy: Strategy::Path,
        digest: legacy_digest(path),
    }
}
