//! Validators (C6) — key/value/TTL/batch-count boundary checks (§4.6, §8).
//!
//! Namespace *format* (for registry entries, §4.4) is the one check here
//! that reaches for a compiled pattern rather than a hand-rolled scan,
//! matching the compiled-pattern style `daemon/src/security.rs` uses for its
//! redaction scanner — the character class is fixed and checked at registry
//! load time, off the request hot path, so the `regex` cost is a non-issue.

use crate::error::GatewayError;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

static NAMESPACE_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+:$").unwrap());

pub fn namespace_format_is_valid(ns: &str) -> bool {
    ns.len() <= 128 && NAMESPACE_FORMAT.is_match(ns)
}

/// Key length bound, applied to the raw (not namespace-qualified) key as
/// supplied by the client.
pub fn validate_key_len(key: &str, max_key: usize) -> Result<(), GatewayError> {
    if key.len() > max_key {
        return Err(GatewayError::InvalidKey);
    }
    Ok(())
}

/// Decode a base64-carried value and enforce `max_val` on the decoded byte
/// length (§4.6: "the max_val limit applies to the decoded byte length").
pub fn decode_value(value_b64: &str, max_val: usize) -> Result<Vec<u8>, GatewayError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value_b64)
        .map_err(|_| GatewayError::InvalidValue)?;
    if bytes.len() > max_val {
        return Err(GatewayError::InvalidValue);
    }
    Ok(bytes)
}

pub fn encode_value(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// TTL must be a positive integer.
pub fn validate_ttl(ttl: i64) -> Result<u64, GatewayError> {
    if ttl <= 0 {
        return Err(GatewayError::InvalidValue);
    }
    Ok(ttl as u64)
}

/// `mget` batch size bound — exceeding it is `PAYLOAD_TOO_LARGE`, not
/// `INVALID_KEY`, per §4.6's per-method error table.
pub fn validate_mget_count(count: usize, mget_max: usize) -> Result<(), GatewayError> {
    if count > mget_max {
        return Err(GatewayError::PayloadTooLarge);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_format_accepts_trailing_colon_alnum() {
        assert!(namespace_format_is_valid("appA:"));
        assert!(namespace_format_is_valid("my-app_1:"));
    }

    #[test]
    fn namespace_format_rejects_missing_colon() {
        assert!(!namespace_format_is_valid("appA"));
    }

    #[test]
    fn namespace_format_rejects_bad_chars() {
        assert!(!namespace_format_is_valid("app A:"));
    }

    #[test]
    fn key_len_boundary() {
        let k = "a".repeat(256);
        assert!(validate_key_len(&k, 256).is_ok());
        let k2 = "a".repeat(257);
        assert_eq!(validate_key_len(&k2, 256).unwrap_err(), GatewayError::InvalidKey);
    }

    #[test]
    fn value_len_boundary() {
        let v = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 65_536]);
        assert!(decode_value(&v, 65_536).is_ok());
        let v2 = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 65_537]);
        assert_eq!(decode_value(&v2, 65_536).unwrap_err(), GatewayError::InvalidValue);
    }

    #[test]
    fn invalid_base64_is_invalid_value() {
        assert_eq!(decode_value("not base64!!", 100).unwrap_err(), GatewayError::InvalidValue);
    }

    #[test]
    fn ttl_must_be_positive() {
        assert!(validate_ttl(60).is_ok());
        assert_eq!(validate_ttl(0).unwrap_err(), GatewayError::InvalidValue);
        assert_eq!(validate_ttl(-1).unwrap_err(), GatewayError::InvalidValue);
    }

    #[test]
    fn mget_count_boundary() {
        assert!(validate_mget_count(16, 16).is_ok());
        assert_eq!(validate_mget_count(17, 16).unwrap_err(), GatewayError::PayloadTooLarge);
    }

    #[test]
    fn value_roundtrip_encode_decode() {
        let bytes = b"Hello".to_vec();
        let encoded = encode_value(&bytes);
        assert_eq!(encoded, "SGVsbG8=");
        assert_eq!(decode_value(&encoded, 100).unwrap(), bytes);
    }
}
