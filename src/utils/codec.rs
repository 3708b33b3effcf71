//! Binary and text payload encoding.
//!
//! Wire payloads are bincode. Text transports (mailbox subjects and bodies) carry the
//! standard base64 alphabet of the same bincode bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Serialize};

use crate::Result;

/// Encodes a value as bincode.
///
/// # Errors
///
/// Returns [`crate::Error::Codec`] if serialization fails.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decodes a bincode value.
///
/// # Errors
///
/// Returns [`crate::Error::Codec`] if `data` is not a valid encoding of `T`.
pub fn from_bytes<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}

/// Encodes a value as base64 of its bincode bytes.
///
/// # Errors
///
/// Returns [`crate::Error::Codec`] if serialization fails.
pub fn to_base64<T: Serialize>(value: &T) -> Result<String> {
    Ok(STANDARD.encode(to_bytes(value)?))
}

/// Decodes a value from base64 of its bincode bytes.
///
/// # Errors
///
/// Returns [`crate::Error::Codec`] for invalid base64 or an invalid encoding of `T`.
pub fn from_base64<T: DeserializeOwned>(text: &str) -> Result<T> {
    let data = STANDARD.decode(text.trim())?;
    from_bytes(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Value;

    #[test]
    fn test_base64_uses_standard_alphabet() {
        let text = to_base64(&vec![Value::Str("~~~".into())]).unwrap();
        assert!(text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='));
        let back: Vec<Value> = from_base64(&text).unwrap();
        assert_eq!(back, vec![Value::Str("~~~".into())]);
    }

    #[test]
    fn test_invalid_input_is_a_codec_error() {
        assert!(matches!(
            from_base64::<Vec<Value>>("not base64!"),
            Err(crate::Error::Codec(_))
        ));
        assert!(matches!(
            from_bytes::<Vec<Value>>(&[0xFF; 3]),
            Err(crate::Error::Codec(_))
        ));
    }
}
