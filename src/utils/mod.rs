//! Shared helpers: content digests and payload encoding.

mod codec;
mod hash;

pub use codec::{from_base64, from_bytes, to_base64, to_bytes};
pub use hash::{is_hex_digest, DigestAlgorithm};
