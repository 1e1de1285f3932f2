//! # Migration Checksum
//!
//! Content hashes used to detect edits to scripts after they were deployed.
//! The checksum covers the raw file bytes, so whitespace and comment edits
//! count as changes too.

use sha2::{Digest, Sha256};

const PREFIX: &str = "sha256:";

/// Compute the checksum for migration content
///
/// Same content always produces the same checksum.
pub fn compute_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{}{}", PREFIX, hex::encode(hasher.finalize()))
}

/// Verify checksum matches content
pub fn verify_checksum(content: &[u8], expected: &str) -> bool {
    compute_checksum(content) == expected
}

/// Extract the raw digest from a formatted checksum
///
/// Parses "sha256:<64 hex digits>".
pub fn parse_checksum(formatted: &str) -> Option<[u8; 32]> {
    let hex_part = formatted.strip_prefix(PREFIX)?;
    let bytes = hex::decode(hex_part).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_checksum_deterministic() {
        let c1 = compute_checksum(b"CREATE TABLE t (id INTEGER);");
        let c2 = compute_checksum(b"CREATE TABLE t (id INTEGER);");
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_compute_checksum_format() {
        let checksum = compute_checksum(b"test");
        assert!(checksum.starts_with("sha256:"));
        assert_eq!(checksum.len(), 7 + 64);
    }

    #[test]
    fn test_verify_checksum() {
        let checksum = compute_checksum(b"migration content");
        assert!(verify_checksum(b"migration content", &checksum));
        assert!(!verify_checksum(b"migration content ", &checksum));
    }

    #[test]
    fn test_parse_checksum() {
        let checksum = compute_checksum(b"abc");
        assert!(parse_checksum(&checksum).is_some());
        assert!(parse_checksum("crc32:ABC12345").is_none());
        assert!(parse_checksum("sha256:zz").is_none());
    }
}
