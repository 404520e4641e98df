//! Content hashing. Fixed to BLAKE3, 32-byte digest, lowercase 64-char hex
//! for on-disk naming and manifest references.

/// Compute the content hash of `bytes`, returning lowercase hex (64 chars).
pub fn compute_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Verify that `bytes` hashes to `expected`.
pub fn verify_hash(bytes: &[u8], expected: &str) -> bool {
    compute_hash(bytes) == expected
}

/// Validate that a string looks like a hash we produced: 64 lowercase hex chars.
pub fn is_well_formed(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
