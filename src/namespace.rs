//! Namespace Guard (C5) — validates and canonicalizes a client-supplied key
//! into its connection's namespace, per §4.5.
//!
//! Same defensive shape as `daemon/src/security.rs`'s `safe_path`: reject
//! absolute/escaping input up front, then either accept the prefixed form or
//! auto-prefix. Forbidden-pattern scanning is a single linear pass rather
//! than a `Regex`, following `security.rs`'s `sanitize_tool_input` (the
//! pattern set here is small and fixed, so a compiled regex buys nothing).

use crate::error::GatewayError;
use std::collections::HashSet;

const FORBIDDEN_SUBSTRINGS: &[&str] = &["..", "${", "$((", "eval(", "exec("];
const FORBIDDEN_CHARS: &[char] = &['\0', '\r', '\n', '*', '?', '[', ']', '\\'];

/// Validate `key` against `namespace` (which must already end in `:`) and
/// return the fully-qualified backend key on success.
///
/// `foreign_namespaces` is every namespace string in use by some *other*
/// connection (§4.4's registry). A key containing an early `:` is only
/// rejected as a foreign-namespace escape when its prefix up to and
/// including that colon matches one of those — an ordinary key that merely
/// contains a colon as an internal separator (`"user:123"`) is not, since
/// `"user:"` names no connection's namespace.
pub fn resolve(
    namespace: &str,
    key: &str,
    foreign_namespaces: &HashSet<String>,
) -> Result<String, GatewayError> {
    if key.is_empty() {
        return Err(GatewayError::Restricted);
    }
    if key.trim().is_empty() {
        return Err(GatewayError::Restricted);
    }
    if contains_forbidden(key) {
        return Err(GatewayError::Restricted);
    }

    if let Some(stripped) = key.strip_prefix(namespace) {
        let _ = stripped;
        return Ok(key.to_string());
    }

    if let Some(rel_pos) = key.as_bytes().iter().skip(1).position(|&b| b == b':') {
        let prefix = &key[..rel_pos + 2];
        if prefix != namespace && foreign_namespaces.contains(prefix) {
            return Err(GatewayError::Restricted);
        }
    }

    Ok(format!("{namespace}{key}"))
}

fn contains_forbidden(key: &str) -> bool {
    if FORBIDDEN_SUBSTRINGS.iter().any(|pat| key.contains(pat)) {
        return true;
    }
    if key.contains("...") {
        return true;
    }
    for c in key.chars() {
        if FORBIDDEN_CHARS.contains(&c) {
            return true;
        }
        let code = c as u32;
        let is_control = matches!(code, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F | 0x7F);
        if is_control {
            return true;
        }
    }
    false
}
