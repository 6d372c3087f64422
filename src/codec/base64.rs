//! Tolerant Base64 decoding
//!
//! Subscription sources are sloppy about Base64: standard and URL-safe
//! alphabets both occur in the wild, padding is frequently missing, and
//! line breaks may be embedded anywhere. The decoder here tries each
//! variant in turn before giving up.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use tracing::trace;

/// Decodes Base64 content, trying multiple variants
pub fn decode_base64(content: &str) -> Option<Vec<u8>> {
    // Remove all whitespace (handles line breaks within Base64)
    let cleaned: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(decoded) = STANDARD.decode(&cleaned) {
        trace!("Decoded using standard Base64");
        return Some(decoded);
    }

    if let Ok(decoded) = URL_SAFE.decode(&cleaned) {
        trace!("Decoded using URL-safe Base64");
        return Some(decoded);
    }

    if let Ok(decoded) = URL_SAFE_NO_PAD.decode(&cleaned) {
        trace!("Decoded using URL-safe Base64 without padding");
        return Some(decoded);
    }

    let padded = add_padding(&cleaned);
    if let Ok(decoded) = STANDARD.decode(&padded) {
        trace!("Decoded using standard Base64 with added padding");
        return Some(decoded);
    }
    if let Ok(decoded) = URL_SAFE.decode(&padded) {
        trace!("Decoded using URL-safe Base64 with added padding");
        return Some(decoded);
    }

    None
}

/// Decodes Base64 content into a UTF-8 string
pub fn decode_base64_str(content: &str) -> Option<String> {
    decode_base64(content).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Encodes with the standard alphabet, no line breaks
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Adds proper padding to a Base64 string if missing
fn add_padding(s: &str) -> String {
    let mut result = s.to_string();
    while result.len() % 4 != 0 {
        result.push('=');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_standard() {
        let decoded = decode_base64("SGVsbG8gV29ybGQ=").unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "Hello World");
    }

    #[test]
    fn test_decode_url_safe() {
        assert!(decode_base64("SGVsbG8tV29ybGRf").is_some());
    }

    #[test]
    fn test_decode_with_linebreaks() {
        let decoded = decode_base64("SGVs\nbG8g\nV29y\nbGQ=").unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "Hello World");
    }

    #[test]
    fn test_decode_without_padding() {
        let decoded = decode_base64("SGVsbG8gV29ybGQ").unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "Hello World");
    }

    #[test]
    fn test_decode_invalid() {
        assert!(decode_base64("not base64 at all!!!").is_none());
        assert!(decode_base64("").is_none());
    }

    #[test]
    fn test_encode_roundtrip() {
        let encoded = encode_base64(b"Hello World");
        assert_eq!(decode_base64(&encoded).unwrap(), b"Hello World");
    }
}
