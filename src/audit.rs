//! Audit Log (C11) — bounded, redacted per-request records plus aggregate
//! statistics (§3, §4.10).
//!
//! Grounded on `daemon/src/storage/event_log.rs`'s `AuditEntry`/`AuditLog`
//! split: hash the sensitive field, never store it raw, and never let a
//! broken audit path block request processing (§9: "audit append is
//! best-effort"). Moved from an append-only file to an in-memory
//! head-push/tail-trim list per spec.md §3's bounded-list invariant; the
//! key_hash uses a keyed HMAC-SHA256 rather than a bare hash (open question
//! resolution, SPEC_FULL.md) so a small key space can't be dictionary-attacked
//! from leaked audit records.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_ENTRIES: usize = 10_000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditRecord {
    pub method: String,
    pub key_hash: Option<String>,
    pub value_size: Option<usize>,
    pub status: &'static str,
    pub error_code: Option<&'static str>,
    pub latency_ms: u64,
    pub client_redacted: String,
    pub timestamp: String,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct AuditStats {
    pub total: usize,
    pub success: usize,
    pub by_method: std::collections::HashMap<String, usize>,
    pub by_error_code: std::collections::HashMap<String, usize>,
    pub success_rate: f64,
    pub mean_latency_ms: f64,
}

pub struct AuditLog {
    hmac_key: Vec<u8>,
    records: Mutex<VecDeque<AuditRecord>>,
}

impl AuditLog {
    /// `server_secret_hex` keys the HMAC so key_hash values are not
    /// reproducible by anyone who doesn't also hold the server secret.
    pub fn new(server_secret_hex: &[u8]) -> Self {
        Self {
            hmac_key: server_secret_hex.to_vec(),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn key_hash(&self, fully_qualified_key: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).expect("HMAC accepts any key length");
        mac.update(fully_qualified_key.as_bytes());
        let digest = mac.finalize().into_bytes();
        hex::encode(digest)[..8].to_string()
    }

    pub fn redact_pubkey(pubkey_hex: &str) -> String {
        if pubkey_hex.len() <= 8 {
            return pubkey_hex.to_string();
        }
        format!("{}…{}", &pubkey_hex[..4], &pubkey_hex[pubkey_hex.len() - 4..])
    }

    /// Append a record, trimming the oldest entry if at capacity. Best-effort:
    /// takes the lock briefly and never awaits, so it cannot stall request
    /// processing on a degraded backend (§9).
    pub fn append(&self, record: AuditRecord) {
        let mut records = self.records.lock().unwrap();
        if records.len() >= MAX_ENTRIES {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn stats(&self, window_ms: u64) -> AuditStats {
        let records = self.records.lock().unwrap();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::milliseconds(window_ms as i64);

        let mut stats = AuditStats::default();
        let mut latency_sum: u64 = 0;

        for record in records.iter() {
            let Ok(ts) = chrono::DateTime::parse_from_rfc3339(&record.timestamp) else {
                continue;
            };
            if ts < cutoff {
                continue;
            }
            stats.total += 1;
            if record.status == "ok" {
                stats.success += 1;
            }
            *stats.by_method.entry(record.method.clone()).or_insert(0) += 1;
            if let Some(code) = record.error_code {
                *stats.by_error_code.entry(code.to_string()).or_insert(0) += 1;
            }
            latency_sum += record.latency_ms;
        }

        if stats.total > 0 {
            stats.success_rate = stats.success as f64 / stats.total as f64;
            stats.mean_latency_ms = latency_sum as f64 / stats.total as f64;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(method: &str, status: &'static str, error_code: Option<&'static str>) -> AuditRecord {
        AuditRecord {
            method: method.to_string(),
            key_hash: Some("abcd1234".to_string()),
            value_size: Some(5),
            status,
            error_code,
            latency_ms: 10,
            client_redacted: "abcd…wxyz".to_string(),
            timestamp: now_rfc3339(),
        }
    }

    #[test]
    fn key_hash_is_deterministic_and_keyed() {
        let log_a = AuditLog::new(b"secret-a");
        let log_b = AuditLog::new(b"secret-b");
        let h1 = log_a.key_hash("appA:user:123");
        let h2 = log_a.key_hash("appA:user:123");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 8);
        assert_ne!(h1, log_b.key_hash("appA:user:123"));
    }

    #[test]
    fn redact_pubkey_keeps_first4_last4() {
        let pk = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcd";
        let redacted = AuditLog::redact_pubkey(pk);
        assert_eq!(redacted, "0123…abcd");
    }

    #[test]
    fn bounded_list_trims_at_capacity() {
        let log = AuditLog::new(b"secret");
        for _ in 0..(MAX_ENTRIES + 5) {
            log.append(sample("get", "ok", None));
        }
        assert_eq!(log.len(), MAX_ENTRIES);
    }

    #[test]
    fn stats_counts_by_method_and_error_code() {
        let log = AuditLog::new(b"secret");
        log.append(sample("get", "ok", None));
        log.append(sample("get", "ok", None));
        log.append(sample("set", "error", Some("RESTRICTED")));

        let stats = log.stats(60_000);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.by_method.get("get"), Some(&2));
        assert_eq!(stats.by_error_code.get("RESTRICTED"), Some(&1));
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
