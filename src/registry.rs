//! Connection Registry (C4) — maps client public keys to authorized policy
//! (§3, §4.4), plus the `ClientConnection` state each policy backs.
//!
//! `ClientConnection` is an owned record behind `Arc<Mutex<_>>`; the registry
//! itself is a `RwLock<HashMap<...>>` keyed by client pubkey — "an owned
//! record behind an atomically-refcounted handle plus a mutex" is spec.md's
//! own §9 design note, and it matches the per-connection-mutex model
//! `daemon/src/ipc/mod.rs` uses for its rate limiters. Persistence follows
//! `daemon/src/config/mod.rs`'s `load_toml` read-parse-log-on-error shape,
//! applied to a JSON document instead of TOML (no hot-reload watcher; C4's
//! reload is triggered explicitly by SIGHUP, not a filesystem watch).

use crate::budget::RateByteBudget;
use crate::config::{Limits, GatewayConfig};
use crate::idempotency::IdempotencyCache;
use crate::validators::namespace_format_is_valid;
use nostr_sdk::prelude::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, warn};

pub const ALL_METHODS: &[&str] = &[
    "get_info", "get", "set", "del", "exists", "mget", "expire", "ttl",
];

#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub namespace: String,
    pub allowed_methods: HashSet<String>,
    pub limits: Limits,
    pub app_name: Option<String>,
}

/// On-disk shape of one registry entry (§6: "Persisted state").
#[derive(Debug, Deserialize, Serialize)]
struct RegistryEntry {
    namespace: String,
    #[serde(rename = "allowedMethods")]
    allowed_methods: Vec<String>,
    limits: RegistryLimits,
    #[serde(rename = "appName")]
    app_name: Option<String>,
    created: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RegistryLimits {
    mps: u32,
    bps: u64,
    #[serde(rename = "maxKey")]
    max_key: usize,
    #[serde(rename = "maxVal")]
    max_val: usize,
    #[serde(rename = "mgetMax")]
    mget_max: usize,
}

pub struct ClientConnection {
    pub client_pubkey: PublicKey,
    pub policy: ConnectionPolicy,
    pub budget: Mutex<RateByteBudget>,
    pub idempotency: Mutex<IdempotencyCache>,
}

impl ClientConnection {
    fn new(client_pubkey: PublicKey, policy: ConnectionPolicy) -> Self {
        let budget = RateByteBudget::new(policy.limits.mps, policy.limits.bps);
        Self {
            client_pubkey,
            policy,
            budget: Mutex::new(budget),
            idempotency: Mutex::new(IdempotencyCache::default()),
        }
    }
}

pub struct Registry {
    path: PathBuf,
    default_policy: ConnectionPolicy,
    policies: RwLock<HashMap<PublicKey, ConnectionPolicy>>,
    connections: RwLock<HashMap<PublicKey, Arc<ClientConnection>>>,
}

impl Registry {
    pub async fn load(config: &GatewayConfig) -> Self {
        let default_policy = ConnectionPolicy {
            namespace: config.namespace.clone(),
            allowed_methods: ALL_METHODS.iter().map(|s| s.to_string()).collect(),
            limits: config.limits.clone(),
            app_name: None,
        };

        let registry = Self {
            path: config.registry_path.clone(),
            default_policy,
            policies: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        };
        registry.reload().await;
        registry
    }

    /// Re-read the registry JSON document from disk, discarding any
    /// malformed entries (§4.4: "must validate namespace format at load
    /// time and reject malformed entries"). Safe to call while connections
    /// are live — existing `ClientConnection`s keep their already-resolved
    /// policy until a fresh request looks them up again.
    pub async fn reload(&self) {
        let Ok(contents) = tokio::fs::read_to_string(&self.path).await else {
            return;
        };
        let raw: HashMap<String, RegistryEntry> = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                error!(path = %self.path.display(), err = %e, "failed to parse connection registry — keeping previous state");
                return;
            }
        };

        let mut parsed = HashMap::new();
        for (pubkey_hex, entry) in raw {
            let pubkey = match PublicKey::parse(&pubkey_hex) {
                Ok(pk) => pk,
                Err(e) => {
                    warn!(pubkey = %pubkey_hex, err = %e, "registry entry has malformed pubkey — skipping");
                    continue;
                }
            };
            if !namespace_format_is_valid(&entry.namespace) {
                warn!(pubkey = %pubkey_hex, ns = %entry.namespace, "registry entry has malformed namespace — skipping");
                continue;
            }
            parsed.insert(
                pubkey,
                ConnectionPolicy {
                    namespace: entry.namespace,
                    allowed_methods: entry.allowed_methods.into_iter().collect(),
                    limits: Limits {
                        mps: entry.limits.mps,
                        bps: entry.limits.bps,
                        max_key: entry.limits.max_key,
                        max_val: entry.limits.max_val,
                        mget_max: entry.limits.mget_max,
                    },
                    app_name: entry.app_name,
                },
            );
        }

        *self.policies.write().await = parsed;
    }

    /// Resolve (creating lazily with default policy if needed) the
    /// `ClientConnection` for `client_pubkey` (§3: "created when the first
    /// valid event from a client pubkey is processed").
    pub async fn connection_for(&self, client_pubkey: PublicKey) -> Arc<ClientConnection> {
        if let Some(conn) = self.connections.read().await.get(&client_pubkey) {
            return conn.clone();
        }

        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get(&client_pubkey) {
            return conn.clone();
        }

        let policy = self
            .policies
            .read()
            .await
            .get(&client_pubkey)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone());

        let conn = Arc::new(ClientConnection::new(client_pubkey, policy));
        connections.insert(client_pubkey, conn.clone());
        conn
    }

    /// Every namespace string configured for some *other* connection, plus
    /// the process default — used by the Namespace Guard (§4.5 step 4) to
    /// tell an actual foreign-namespace escape from an ordinary key that
    /// merely contains a colon.
    pub async fn foreign_namespaces(&self, exclude: &str) -> HashSet<String> {
        let mut set: HashSet<String> = self
            .policies
            .read()
            .await
            .values()
            .map(|p| p.namespace.clone())
            .collect();
        set.insert(self.default_policy.namespace.clone());
        set.remove(exclude);
        set
    }

    pub async fn snapshot(&self) -> Vec<(PublicKey, ConnectionPolicy)> {
        self.policies
            .read()
            .await
            .iter()
            .map(|(pk, p)| (*pk, p.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawArgs;

    fn test_config(dir: &std::path::Path) -> GatewayConfig {
        GatewayConfig::new(RawArgs {
            backend_url: None,
            namespace: Some("default:".to_string()),
            relays: Some("wss://relay.example".to_string()),
            server_secret: Some(nostr_sdk::Keys::generate().secret_key().to_secret_hex()),
            encryption_pref: None,
            limit_mps: None,
            limit_bps: None,
            limit_max_key: None,
            limit_max_val: None,
            limit_mget_max: None,
            registry_path: Some(dir.join("connections.json")),
            data_dir: Some(dir.to_path_buf()),
            log: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_client_gets_default_policy() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let reg = Registry::load(&cfg).await;

        let pk = nostr_sdk::Keys::generate().public_key();
        let conn = reg.connection_for(pk).await;
        assert_eq!(conn.policy.namespace, "default:");
        assert_eq!(conn.policy.allowed_methods.len(), ALL_METHODS.len());
    }

    #[tokio::test]
    async fn connection_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let reg = Registry::load(&cfg).await;
        let pk = nostr_sdk::Keys::generate().public_key();

        let a = reg.connection_for(pk).await;
        let b = reg.connection_for(pk).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn loads_valid_registry_entry_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let client_pk = nostr_sdk::Keys::generate().public_key();

        let doc = serde_json::json!({
            client_pk.to_hex(): {
                "namespace": "appA:",
                "allowedMethods": ["get", "set"],
                "limits": {"mps": 10, "bps": 1024, "maxKey": 64, "maxVal": 256, "mgetMax": 4},
                "appName": "test-app",
                "created": "2026-01-01T00:00:00Z",
            }
        });
        tokio::fs::write(&cfg.registry_path, doc.to_string()).await.unwrap();

        let reg = Registry::load(&cfg).await;
        let conn = reg.connection_for(client_pk).await;
        assert_eq!(conn.policy.namespace, "appA:");
        assert!(conn.policy.allowed_methods.contains("get"));
        assert!(!conn.policy.allowed_methods.contains("del"));
        assert_eq!(conn.policy.limits.mps, 10);
    }

    #[tokio::test]
    async fn malformed_registry_entry_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let client_pk = nostr_sdk::Keys::generate().public_key();

        let doc = serde_json::json!({
            client_pk.to_hex(): {
                "namespace": "bad namespace",
                "allowedMethods": ["get"],
                "limits": {"mps": 10, "bps": 1024, "maxKey": 64, "maxVal": 256, "mgetMax": 4},
                "appName": null,
                "created": null,
            }
        });
        tokio::fs::write(&cfg.registry_path, doc.to_string()).await.unwrap();

        let reg = Registry::load(&cfg).await;
        let conn = reg.connection_for(client_pk).await;
        // Falls back to default policy since the entry was rejected at load time.
        assert_eq!(conn.policy.namespace, "default:");
    }
}
