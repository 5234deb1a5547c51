//! Base64 helpers for header envelopes and forwarded bodies.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;

/// Encodes raw bytes into a standard-alphabet base64 string.
pub fn encode<T: AsRef<[u8]>>(input: T) -> String {
    b64.encode(input.as_ref())
}

/// Decodes a standard-alphabet base64 string.
pub fn decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    b64.decode(input.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let encoded = encode(b"shielded");
        assert_eq!(encoded, "c2hpZWxkZWQ=");
        assert_eq!(decode(&encoded).unwrap(), b"shielded");
    }

    #[test]
    fn test_decode_trims_whitespace() {
        assert_eq!(decode(" c2hpZWxkZWQ=\n").unwrap(), b"shielded");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not@base64!").is_err());
    }
}
