//! Wire payload encodings for `write`, `upload`, and `onMessage` messages

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Encoding of a message payload on the RPC surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Base64,
    Hex,
    Utf8,
}

impl PayloadEncoding {
    /// Decode a wire message into raw bytes.
    pub fn decode(&self, message: &str) -> Result<Vec<u8>> {
        match self {
            PayloadEncoding::Base64 => STANDARD
                .decode(message)
                .map_err(|e| LinkError::Encoding(format!("invalid base64: {}", e))),
            PayloadEncoding::Hex => {
                hex::decode(message).map_err(|e| LinkError::Encoding(format!("invalid hex: {}", e)))
            }
            PayloadEncoding::Utf8 => Ok(message.as_bytes().to_vec()),
        }
    }

    /// Encode raw bytes into a wire message.
    pub fn encode(&self, data: &[u8]) -> String {
        match self {
            PayloadEncoding::Base64 => STANDARD.encode(data),
            PayloadEncoding::Hex => hex::encode(data),
            PayloadEncoding::Utf8 => String::from_utf8_lossy(data).into_owned(),
        }
    }

    /// Wire name of this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadEncoding::Base64 => "base64",
            PayloadEncoding::Hex => "hex",
            PayloadEncoding::Utf8 => "utf8",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_decode() {
        let data = PayloadEncoding::Base64.decode("aGVsbG8=").unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_hex_decode_wake_byte() {
        // The micro:bit wake-up handshake is the single byte 0x04
        let data = PayloadEncoding::Hex.decode("04").unwrap();
        assert_eq!(data, vec![0x04]);
    }

    #[test]
    fn test_utf8_passthrough() {
        let data = PayloadEncoding::Utf8.decode("abc").unwrap();
        assert_eq!(data, b"abc");
    }

    #[test]
    fn test_encode_round_trip() {
        for encoding in [PayloadEncoding::Base64, PayloadEncoding::Hex] {
            let wire = encoding.encode(&[0x01, 0x02, 0xff]);
            assert_eq!(encoding.decode(&wire).unwrap(), vec![0x01, 0x02, 0xff]);
        }
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        assert!(PayloadEncoding::Base64.decode("@@@").is_err());
        assert!(PayloadEncoding::Hex.decode("zz").is_err());
    }

    #[test]
    fn test_wire_names() {
        let encoding: PayloadEncoding = serde_json::from_str("\"base64\"").unwrap();
        assert_eq!(encoding, PayloadEncoding::Base64);
        assert_eq!(encoding.as_str(), "base64");
        assert_eq!(PayloadEncoding::default(), PayloadEncoding::Base64);
    }
}
