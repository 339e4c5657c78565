use sha2::{Digest, Sha256};

/// SHA-256 digest of `payload`, lower-case hex.
pub fn calculate(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Recompute the digest of `payload` and compare it with `expected`.
pub fn verify(payload: &[u8], expected: &str) -> bool {
    calculate(payload).eq_ignore_ascii_case(expected.trim())
}
