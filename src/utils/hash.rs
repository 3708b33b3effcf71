//! Content digests of code modules.
//!
//! The module hash carried by every execution request is the hex-encoded digest of the
//! module file bytes. The server compares it against loaded and probed modules to detect
//! stale copies, and uses it to name the per-version sandbox directory.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use strum::{Display, EnumString};

/// Algorithm used for module content digests.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-1, 40 hex characters
    #[default]
    Sha1,
    /// MD5, 32 hex characters
    Md5,
}

impl DigestAlgorithm {
    /// Computes the lowercase hex digest of `data`.
    ///
    /// # Arguments
    ///
    /// * `data` - The bytes to hash, usually a complete module file
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nomad::utils::DigestAlgorithm;
    ///
    /// let digest = DigestAlgorithm::Sha1.digest(b"abc");
    /// assert_eq!(digest, "a9993e364706816aba3e25717850c26c9cd0d89d");
    /// ```
    #[must_use]
    pub fn digest(self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            DigestAlgorithm::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
        }
    }

    /// Length of the hex digest produced by this algorithm.
    #[must_use]
    pub fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 40,
            DigestAlgorithm::Md5 => 32,
        }
    }

    /// Guesses the algorithm from the length of a hex digest.
    #[must_use]
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(DigestAlgorithm::Sha1),
            32 => Some(DigestAlgorithm::Md5),
            _ => None,
        }
    }
}

/// Checks that `hash` looks like a hex digest, so it can safely name a directory.
#[must_use]
pub fn is_hex_digest(hash: &str) -> bool {
    DigestAlgorithm::from_hex_len(hash.len()).is_some()
        && hash.bytes().all(|b| b.is_ascii_hexdigit())
}
