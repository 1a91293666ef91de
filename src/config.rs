//! Process configuration — environment variables and CLI flags only.
//!
//! No TOML profile layer: the surface named in spec.md (`backend_url`,
//! `namespace`, `relays`, `server_secret`, `encryption_pref`, `limits.*`,
//! `log_level`) is already flat and complete, so a second config file would
//! just be another source of truth to keep in sync. CLI flags (via `clap`
//! `env` feature) and `KVGATE_*` environment variables map to the same
//! fields, matching `Args`'s priority model in the daemon's `main.rs`.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPref {
    V2,
    V1,
}

impl std::str::FromStr for EncryptionPref {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v2" => Ok(EncryptionPref::V2),
            "v1" => Ok(EncryptionPref::V1),
            other => bail!("invalid encryption_pref '{other}' — expected 'v2' or 'v1'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub mps: u32,
    pub bps: u64,
    pub max_key: usize,
    pub max_val: usize,
    pub mget_max: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            mps: 60,
            bps: 1_048_576,
            max_key: 256,
            max_val: 65_536,
            mget_max: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backend_url: String,
    pub namespace: String,
    pub relays: Vec<String>,
    /// bech32 `nsec1...` or 64-char hex server secret scalar.
    pub server_secret: String,
    pub encryption_pref: EncryptionPref,
    pub limits: Limits,
    pub registry_path: PathBuf,
    pub data_dir: PathBuf,
    pub log: String,
}

/// Raw values collected from CLI flags (each already merged with its
/// `KVGATE_*` env var by clap). `None` means "use the default".
pub struct RawArgs {
    pub backend_url: Option<String>,
    pub namespace: Option<String>,
    pub relays: Option<String>,
    pub server_secret: Option<String>,
    pub encryption_pref: Option<String>,
    pub limit_mps: Option<u32>,
    pub limit_bps: Option<u64>,
    pub limit_max_key: Option<usize>,
    pub limit_max_val: Option<usize>,
    pub limit_mget_max: Option<usize>,
    pub registry_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub log: Option<String>,
}

impl GatewayConfig {
    /// Build the final config, failing fast on a missing `server_secret` or
    /// `relays` — both are required and a malformed/absent value is fatal at
    /// startup (§4.1).
    pub fn new(raw: RawArgs) -> Result<Self> {
        let data_dir = raw.data_dir.unwrap_or_else(default_data_dir);

        let server_secret = raw
            .server_secret
            .filter(|s| !s.is_empty())
            .context("KVGATE_SERVER_SECRET is required (bech32 nsec1... or 64-char hex)")?;

        let relays: Vec<String> = raw
            .relays
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if relays.is_empty() {
            bail!("KVGATE_RELAYS is required — at least one relay URL");
        }

        let namespace = raw.namespace.unwrap_or_else(|| "kv:".to_string());
        validate_namespace_format(&namespace)
            .with_context(|| format!("invalid configured namespace '{namespace}'"))?;

        let encryption_pref = raw
            .encryption_pref
            .as_deref()
            .unwrap_or("v2")
            .parse()
            .context("invalid KVGATE_ENCRYPTION_PREF")?;

        let registry_path = raw
            .registry_path
            .unwrap_or_else(|| data_dir.join("connections.json"));

        Ok(Self {
            backend_url: raw
                .backend_url
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            namespace,
            relays,
            server_secret,
            encryption_pref,
            limits: Limits {
                mps: raw.limit_mps.unwrap_or(60),
                bps: raw.limit_bps.unwrap_or(1_048_576),
                max_key: raw.limit_max_key.unwrap_or(256),
                max_val: raw.limit_max_val.unwrap_or(65_536),
                mget_max: raw.limit_mget_max.unwrap_or(16),
            },
            registry_path,
            data_dir,
            log: raw.log.unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Namespace format required by §4.4: non-empty, ends in `:`, and everything
/// before the final `:` matches `[A-Za-z0-9_-]+`. Length capped at 128 (§3).
pub fn validate_namespace_format(ns: &str) -> Result<()> {
    if ns.is_empty() || ns.len() > 128 {
        bail!("namespace must be 1-128 characters");
    }
    let Some(prefix) = ns.strip_suffix(':') else {
        bail!("namespace must end with ':'");
    };
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        bail!("namespace must match [A-Za-z0-9_-]+:");
    }
    Ok(())
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("kvgate");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share").join("kvgate");
    }
    PathBuf::from(".kvgate")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(secret: Option<&str>, relays: Option<&str>) -> RawArgs {
        RawArgs {
            backend_url: None,
            namespace: None,
            relays: relays.map(str::to_string),
            server_secret: secret.map(str::to_string),
            encryption_pref: None,
            limit_mps: None,
            limit_bps: None,
            limit_max_key: None,
            limit_max_val: None,
            limit_mget_max: None,
            registry_path: None,
            data_dir: Some(PathBuf::from("/tmp/kvgate-test")),
            log: None,
        }
    }

    #[test]
    fn missing_secret_is_fatal() {
        let cfg = GatewayConfig::new(raw(None, Some("wss://relay.example")));
        assert!(cfg.is_err());
    }

    #[test]
    fn missing_relays_is_fatal() {
        let cfg = GatewayConfig::new(raw(Some("deadbeef"), None));
        assert!(cfg.is_err());
    }

    #[test]
    fn defaults_apply_when_required_fields_present() {
        let cfg = GatewayConfig::new(raw(Some("deadbeef"), Some("wss://relay.example"))).unwrap();
        assert_eq!(cfg.namespace, "kv:");
        assert_eq!(cfg.limits.mps, 60);
        assert_eq!(cfg.encryption_pref, EncryptionPref::V2);
    }

    #[test]
    fn namespace_format_rejects_missing_colon() {
        assert!(validate_namespace_format("kv").is_err());
    }

    #[test]
    fn namespace_format_rejects_bad_chars() {
        assert!(validate_namespace_format("k v:").is_err());
    }

    #[test]
    fn namespace_format_accepts_valid() {
        assert!(validate_namespace_format("app-A_1:").is_ok());
    }
}
