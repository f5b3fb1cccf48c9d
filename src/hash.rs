//! Content hash addressing
//!
//! Every file is named by a fixed-length hex digest. Hashes compare
//! case-insensitively; the canonical form (used for catalog membership and
//! on-disk names) is upper-case.

use crate::error::FileError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default hash length (hex characters)
pub const DEFAULT_HASH_LEN: usize = 40;

/// Canonical upper-case content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a hash of exactly `len` hex characters, normalizing to upper-case.
    /// The empty hash is never valid.
    pub fn parse(raw: &str, len: usize) -> Result<Self, FileError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() != len || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FileError::InvalidHash(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_uppercase()))
    }

    /// Parse a file name, returning `None` for anything that is not hash-shaped
    pub fn from_file_name(name: &str, len: usize) -> Option<Self> {
        Self::parse(name, len).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Subdirectory bucket used to spread files across directories
    pub fn shard_prefix(&self) -> &str {
        self.0.get(..1).unwrap_or_default()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parse a list of raw hashes, dropping malformed entries
pub fn parse_all<I, S>(raw: I, len: usize) -> Vec<ContentHash>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|s| ContentHash::parse(s.as_ref(), len).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOWER: &str = "0a1b2c3d4e5f60718293a4b5c6d7e8f901234567";

    #[test]
    fn test_parse_normalizes_case() {
        let hash = ContentHash::parse(LOWER, DEFAULT_HASH_LEN).unwrap();
        assert_eq!(hash.as_str(), LOWER.to_ascii_uppercase());
        assert_eq!(hash, ContentHash::parse(&LOWER.to_ascii_uppercase(), 40).unwrap());
        assert_eq!(hash.shard_prefix(), "0");
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(ContentHash::parse("abc", DEFAULT_HASH_LEN).is_err());
        assert!(ContentHash::parse(&"g".repeat(40), DEFAULT_HASH_LEN).is_err());
        assert!(ContentHash::parse(&format!("{}.tmp", &LOWER[..36]), DEFAULT_HASH_LEN).is_err());
        // Length is configurable
        assert!(ContentHash::parse(&"a".repeat(64), 64).is_ok());
        assert!(ContentHash::parse("", 0).is_err());
    }

    #[test]
    fn test_parse_all_skips_invalid() {
        let parsed = parse_all(vec![LOWER, "nope", "F".repeat(40).as_str()], DEFAULT_HASH_LEN);
        assert_eq!(parsed.len(), 2);
    }
}
