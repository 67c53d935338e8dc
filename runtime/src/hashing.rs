//! SHA-256 hex hashing used for prompt stability hashes and source
//! fingerprints. Centralized so every call site agrees on encoding.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
