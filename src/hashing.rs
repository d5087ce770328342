//! SHA-256 hashing primitives shared by every layer of the indexer.
//!
//! Three derived forms, all over the same digest:
//!  - `content_hash`: full 64-char lowercase hex — the dedup signal carried
//!    by every stored chunk payload.
//!  - `cache_key`: first 16 hex chars — embedding-cache filenames.
//!  - `point_id`: first 8 digest bytes as a big-endian u64 — the integer ID
//!    the vector store speaks.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Lowercase-hex SHA-256 of the exact UTF-8 bytes of `content`.
///
/// No whitespace normalisation, no observation reordering: the input is the
/// exact string that will be embedded, and equality of this hash is the sole
/// deduplication signal.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex_lower(&digest)
}

/// First 16 hex chars of the content hash — short enough for a filename,
/// long enough for practical uniqueness at project scale. Two strings that
/// share this prefix may collide in the embedding cache; callers treat the
/// cache as best-effort.
pub fn cache_key(content: &str) -> String {
    let mut h = content_hash(content);
    h.truncate(16);
    h
}

/// Deterministic u64 point ID from a stable string key.
///
/// First 8 bytes of the SHA-256 digest, big-endian. A collision between two
/// distinct string keys is a programmer bug and is surfaced loudly during
/// upsert planning, never silently absorbed.
pub fn point_id(string_key: &str) -> u64 {
    let digest = Sha256::digest(string_key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Short hex prefix of the SHA-256 of `input`, used to salt deterministic
/// chunk IDs (metadata uniq-hash, ambiguous relation IDs).
pub fn short_hash(input: &str, hex_len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut h = hex_lower(&digest);
    h.truncate(hex_len);
    h
}

/// Lowercase-hex SHA-256 of raw bytes.
pub fn bytes_sha256(bytes: &[u8]) -> String {
    hex_lower(&Sha256::digest(bytes))
}

/// Streaming SHA-256 of a file's raw bytes, as lowercase hex.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_lower(&hasher.finalize()))
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
