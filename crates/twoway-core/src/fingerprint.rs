//! Content fingerprints used to decide whether a file changed.

use serde::{Deserialize, Serialize};

/// Compute the BLAKE3 hash of content, returning a hex string.
pub fn content_hash(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

/// Size, modification time (seconds since the epoch) and content hash of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime: i64,
    pub hash: String,
}

impl Fingerprint {
    pub fn of(content: &[u8], mtime: i64) -> Self {
        Fingerprint {
            size: content.len() as u64,
            mtime,
            hash: content_hash(content),
        }
    }

    /// True when both sides hold the same bytes, whatever their timestamps.
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.size == other.size && self.hash == other.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        assert_eq!(content_hash(b"hello world"), content_hash(b"hello world"));
        assert_ne!(content_hash(b"hello world"), content_hash(b"hello world!"));
        assert_eq!(content_hash(b"").len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_single_byte_change() {
        let mut a = vec![7u8; 16384];
        let fa = Fingerprint::of(&a, 1_600_000_000);
        a[0x41] = !a[0x41];
        let fb = Fingerprint::of(&a, 1_600_000_000);

        assert_eq!(fa.size, fb.size);
        assert_eq!(fa.mtime, fb.mtime);
        assert_ne!(fa, fb);
        assert!(!fa.same_content(&fb));
    }

    #[test]
    fn test_same_content_ignores_mtime() {
        let fa = Fingerprint::of(b"abc", 10);
        let fb = Fingerprint::of(b"abc", 20);
        assert_ne!(fa, fb);
        assert!(fa.same_content(&fb));
    }
}
