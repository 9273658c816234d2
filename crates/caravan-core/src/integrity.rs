//! # Integrity Checksums
//!
//! SHA-256 checksum arithmetic shared by the Cache Store (per-entry
//! validation) and the Conflict Resolver (protected-field rule).

use sha2::{Digest, Sha256};

/// Computes the hex-encoded SHA-256 checksum of a byte slice.
pub fn checksum_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Constant-shape verification: does `expected` match the checksum of
/// `bytes`? Comparison is case-insensitive on the hex encoding.
pub fn verify_checksum(bytes: &[u8], expected: &str) -> bool {
    checksum_hex(bytes).eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_deterministic() {
        let a = checksum_hex(b"progress:42");
        let b = checksum_hex(b"progress:42");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_verify_checksum() {
        let sum = checksum_hex(b"value");
        assert!(verify_checksum(b"value", &sum));
        assert!(verify_checksum(b"value", &sum.to_uppercase()));
        assert!(!verify_checksum(b"other", &sum));
    }
}
