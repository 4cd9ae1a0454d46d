//! Content hashing for snapshot integrity verification

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
