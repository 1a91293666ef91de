//! Protocol Router (C9) — the nine-step dispatch pipeline of §4.6 for each
//! decrypted request.
//!
//! Grounded on `daemon/src/ipc/mod.rs`'s `dispatch`/`dispatch_text` split:
//! one function per closed method, a `classify_error` boundary that never
//! lets backend detail leak to the caller, and a JSON-RPC-shaped
//! request/response pair. The difference here is the extra pipeline stages
//! (idempotency, rate/byte budget, namespace resolution) the gateway's
//! policy model requires that a bare JSON-RPC daemon didn't.

use crate::audit::{now_rfc3339, AuditLog, AuditRecord};
use crate::config::Limits;
use crate::error::{classify_backend_error, GatewayError};
use crate::kv::KvBackend;
use crate::namespace;
use crate::registry::{ClientConnection, Registry};
use crate::validators;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ResponseError {
    pub code: &'static str,
    pub message: &'static str,
}

impl Response {
    fn ok(id: String, result: Value) -> Self {
        Self { result: Some(result), error: None, id }
    }

    fn err(id: String, e: GatewayError) -> Self {
        Self {
            result: None,
            error: Some(ResponseError { code: e.code(), message: e.message() }),
            id,
        }
    }
}

pub struct Router {
    registry: Arc<Registry>,
    kv: Arc<dyn KvBackend>,
    audit: Arc<AuditLog>,
    encryption_v2: bool,
    encryption_v1: bool,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        kv: Arc<dyn KvBackend>,
        audit: Arc<AuditLog>,
        encryption_v2: bool,
        encryption_v1: bool,
    ) -> Self {
        Self { registry, kv, audit, encryption_v2, encryption_v1 }
    }

    /// Route one decrypted plaintext for `client_pubkey`, returning the
    /// serialized response bytes to encrypt and publish back, or `None` when
    /// the request is structurally unrecoverable (§4.6 step 1's "else drop":
    /// no `id` exists to echo, so per §4.11/§7 band 1 the right behavior is
    /// silence, not a response that would hand an unauthenticated observer
    /// an oracle). `request_bytes` is the size of the already-decrypted
    /// plaintext, accounted against the byte budget alongside the response
    /// (§4.7).
    pub async fn dispatch(&self, client_pubkey: nostr_sdk::PublicKey, request_bytes: &[u8]) -> Option<Vec<u8>> {
        let started = Instant::now();

        // Step 1: structural parse.
        let request: Request = serde_json::from_slice(request_bytes).ok()?;

        let conn = self.registry.connection_for(client_pubkey).await;

        // Step 2: idempotency lookup.
        if let Some(cached) = conn.idempotency.lock().await.get(&request.id) {
            return Some(cached);
        }

        let result = self.dispatch_checked(&conn, &request, request_bytes.len()).await;
        let (response, status, error_code, key_hash, value_size) = match result {
            Ok((value, key_hash, value_size)) => {
                (Response::ok(request.id.clone(), value), "ok", None, key_hash, value_size)
            }
            Err(e) => {
                let code = e.code();
                (Response::err(request.id.clone(), e), "error", Some(code), None, None)
            }
        };

        let bytes = serde_json::to_vec(&response).unwrap_or_default();

        // Step 9: insert idempotency, account response bytes, audit.
        conn.idempotency.lock().await.insert(request.id.clone(), bytes.clone());
        conn.budget.lock().await.consume_bytes(bytes.len() as u64);

        let record = AuditRecord {
            method: request.method.clone(),
            key_hash,
            value_size,
            status,
            error_code,
            latency_ms: started.elapsed().as_millis() as u64,
            client_redacted: AuditLog::redact_pubkey(&client_pubkey.to_hex()),
            timestamp: now_rfc3339(),
        };
        self.persist_audit_record(&conn.policy.namespace, &record);
        self.audit.append(record);

        Some(bytes)
    }

    /// Best-effort backend mirror of the audit record (§3, §6: `<namespace>__audit`,
    /// head-pushed, trimmed at 10 000). Spawned so a degraded backend adds
    /// latency to the audit list, never to request processing (§9).
    fn persist_audit_record(&self, namespace: &str, record: &AuditRecord) {
        let Ok(record_json) = serde_json::to_string(record) else {
            return;
        };
        let kv = self.kv.clone();
        let list_key = format!("{namespace}__audit");
        tokio::spawn(async move {
            if let Err(e) = kv.audit_push(&list_key, &record_json, 10_000).await {
                tracing::warn!(err = %e, "backend audit push failed — degraded, skipping");
            }
        });
    }

    /// Steps 3-8: allowlist, rate/byte budget, param validation, namespace
    /// resolution, and backend dispatch. Returns `(result, key_hash, value_size)`
    /// for audit purposes alongside the JSON value.
    async fn dispatch_checked(
        &self,
        conn: &Arc<ClientConnection>,
        request: &Request,
        request_bytes: usize,
    ) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        // Step 3: method allowlist.
        if !conn.policy.allowed_methods.contains(&request.method) {
            return Err(GatewayError::Restricted);
        }

        // Step 4: rate limit.
        if !conn.budget.lock().await.check_rate() {
            return Err(GatewayError::RateLimited);
        }

        // Step 5: byte budget over the encoded request size.
        if !conn.budget.lock().await.check_bytes(request_bytes as u64) {
            return Err(GatewayError::RateLimited);
        }
        conn.budget.lock().await.consume_bytes(request_bytes as u64);

        self.dispatch_method(conn, request).await
    }

    async fn resolve_key(&self, conn: &ClientConnection, key: &str) -> Result<String, GatewayError> {
        let foreign = self.registry.foreign_namespaces(&conn.policy.namespace).await;
        namespace::resolve(&conn.policy.namespace, key, &foreign)
    }

    async fn dispatch_method(
        &self,
        conn: &Arc<ClientConnection>,
        request: &Request,
    ) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        match request.method.as_str() {
            "get_info" => Ok((self.get_info(conn), None, None)),
            "get" => self.get(conn, &request.params).await,
            "set" => self.set(conn, &request.params).await,
            "del" => self.del(conn, &request.params).await,
            "exists" => self.exists(conn, &request.params).await,
            "mget" => self.mget(conn, &request.params).await,
            "expire" => self.expire(conn, &request.params).await,
            "ttl" => self.ttl(conn, &request.params).await,
            _ => Err(GatewayError::NotImplemented),
        }
    }

    /// Extended per SPEC_FULL.md beyond §4.6's `{methods, ns, limits,
    /// encryption}`: also reports the idempotency window and rate window
    /// length so clients can reason about replay/backoff without guessing.
    fn get_info(&self, conn: &Arc<ClientConnection>) -> Value {
        json!({
            "methods": conn.policy.allowed_methods.iter().collect::<Vec<_>>(),
            "ns": conn.policy.namespace,
            "limits": limits_json(&conn.policy.limits),
            "encryption": { "v2": self.encryption_v2, "v1": self.encryption_v1 },
            "idempotency_window_secs": 60,
            "rate_window_secs": 60,
        })
    }

    async fn get(&self, conn: &Arc<ClientConnection>, params: &Value) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        let key = param_str(params, "key")?;
        validators::validate_key_len(key, conn.policy.limits.max_key)?;
        let fq = self.resolve_key(conn, key).await?;
        let key_hash = Some(self.audit.key_hash(&fq));

        let value = self.kv.get(&fq).await.map_err(|e| classify_backend_error(&e))?;
        let value_size = value.as_ref().map(|v| v.len());
        let encoded = value.map(|v| validators::encode_value(&v));
        Ok((json!({ "value": encoded }), key_hash, value_size))
    }

    async fn set(&self, conn: &Arc<ClientConnection>, params: &Value) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        let key = param_str(params, "key")?;
        validators::validate_key_len(key, conn.policy.limits.max_key)?;
        let value_b64 = param_str(params, "value")?;
        let bytes = validators::decode_value(value_b64, conn.policy.limits.max_val)?;
        let ttl = match params.get("ttl") {
            Some(Value::Null) | None => None,
            Some(v) => {
                let raw = v.as_i64().ok_or(GatewayError::InvalidValue)?;
                Some(validators::validate_ttl(raw)?)
            }
        };
        let fq = self.resolve_key(conn, key).await?;
        let key_hash = Some(self.audit.key_hash(&fq));
        let value_size = Some(bytes.len());

        self.kv.set(&fq, &bytes, ttl).await.map_err(|e| classify_backend_error(&e))?;
        Ok((json!({ "ok": true }), key_hash, value_size))
    }

    async fn del(&self, conn: &Arc<ClientConnection>, params: &Value) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        let key = param_str(params, "key")?;
        validators::validate_key_len(key, conn.policy.limits.max_key)?;
        let fq = self.resolve_key(conn, key).await?;
        let key_hash = Some(self.audit.key_hash(&fq));

        let deleted = self.kv.del(&fq).await.map_err(|e| classify_backend_error(&e))?;
        Ok((json!({ "deleted": deleted }), key_hash, None))
    }

    async fn exists(&self, conn: &Arc<ClientConnection>, params: &Value) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        let key = param_str(params, "key")?;
        validators::validate_key_len(key, conn.policy.limits.max_key)?;
        let fq = self.resolve_key(conn, key).await?;
        let key_hash = Some(self.audit.key_hash(&fq));

        let exists = self.kv.exists(&fq).await.map_err(|e| classify_backend_error(&e))?;
        Ok((json!({ "exists": exists }), key_hash, None))
    }

    async fn mget(&self, conn: &Arc<ClientConnection>, params: &Value) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        let keys = params
            .get("keys")
            .and_then(Value::as_array)
            .ok_or(GatewayError::InvalidKey)?;
        validators::validate_mget_count(keys.len(), conn.policy.limits.mget_max)?;

        let mut fq_keys = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.as_str().ok_or(GatewayError::InvalidKey)?;
            validators::validate_key_len(key, conn.policy.limits.max_key)?;
            fq_keys.push(self.resolve_key(conn, key).await?);
        }

        let values = self.kv.mget(&fq_keys).await.map_err(|e| classify_backend_error(&e))?;
        let total_size = values.iter().flatten().map(|v| v.len()).sum::<usize>();
        let encoded: Vec<Option<String>> = values.into_iter().map(|v| v.map(|b| validators::encode_value(&b))).collect();
        Ok((json!({ "values": encoded }), None, Some(total_size)))
    }

    async fn expire(&self, conn: &Arc<ClientConnection>, params: &Value) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        let key = param_str(params, "key")?;
        validators::validate_key_len(key, conn.policy.limits.max_key)?;
        let ttl_raw = params.get("ttl").and_then(Value::as_i64).ok_or(GatewayError::InvalidValue)?;
        let ttl = validators::validate_ttl(ttl_raw)?;
        let fq = self.resolve_key(conn, key).await?;
        let key_hash = Some(self.audit.key_hash(&fq));

        let ok = self.kv.expire(&fq, ttl).await.map_err(|e| classify_backend_error(&e))?;
        Ok((json!({ "ok": ok }), key_hash, None))
    }

    async fn ttl(&self, conn: &Arc<ClientConnection>, params: &Value) -> Result<(Value, Option<String>, Option<usize>), GatewayError> {
        let key = param_str(params, "key")?;
        validators::validate_key_len(key, conn.policy.limits.max_key)?;
        let fq = self.resolve_key(conn, key).await?;
        let key_hash = Some(self.audit.key_hash(&fq));

        let ttl = self.kv.ttl(&fq).await.map_err(|e| classify_backend_error(&e))?;
        Ok((json!({ "ttl": ttl }), key_hash, None))
    }
}

fn param_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, GatewayError> {
    params.get(name).and_then(Value::as_str).ok_or(GatewayError::InvalidKey)
}

fn limits_json(limits: &Limits) -> Value {
    json!({
        "mps": limits.mps,
        "bps": limits.bps,
        "max_key": limits.max_key,
        "max_val": limits.max_val,
        "mget_max": limits.mget_max,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, RawArgs};
    use crate::kv::tests::FakeKv;
    use nostr_sdk::Keys;

    fn test_config(dir: &std::path::Path) -> GatewayConfig {
        GatewayConfig::new(RawArgs {
            backend_url: None,
            namespace: Some("appA:".to_string()),
            relays: Some("wss://relay.example".to_string()),
            server_secret: Some(Keys::generate().secret_key().to_secret_hex()),
            encryption_pref: None,
            limit_mps: Some(60),
            limit_bps: Some(1_048_576),
            limit_max_key: Some(256),
            limit_max_val: Some(65_536),
            limit_mget_max: Some(16),
            registry_path: Some(dir.join("connections.json")),
            data_dir: Some(dir.to_path_buf()),
            log: None,
        })
        .unwrap()
    }

    async fn test_router(dir: &std::path::Path) -> (Router, nostr_sdk::PublicKey) {
        let (router, client, _kv) = test_router_with_kv(dir).await;
        (router, client)
    }

    async fn test_router_with_kv(dir: &std::path::Path) -> (Router, nostr_sdk::PublicKey, Arc<FakeKv>) {
        let cfg = test_config(dir);
        let registry = Arc::new(Registry::load(&cfg).await);
        let fake = Arc::new(FakeKv::default());
        let kv: Arc<dyn KvBackend> = fake.clone();
        let audit = Arc::new(AuditLog::new(cfg.server_secret.as_bytes()));
        let router = Router::new(registry, kv, audit, true, true);
        (router, Keys::generate().public_key(), fake)
    }

    fn req(method: &str, params: Value, id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({ "method": method, "params": params, "id": id })).unwrap()
    }

    #[tokio::test]
    async fn set_then_get_roundtrips_through_router() {
        let dir = tempfile::tempdir().unwrap();
        let (router, client) = test_router(dir.path()).await;

        let resp = router
            .dispatch(client, &req("set", json!({"key": "user:123", "value": "SGVsbG8=", "ttl": 60}), "r-1"))
            .await
            .unwrap();
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["result"]["ok"], true);

        let resp = router.dispatch(client, &req("get", json!({"key": "user:123"}), "r-2")).await.unwrap();
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["result"]["value"], "SGVsbG8=");
    }

    #[tokio::test]
    async fn namespace_escape_is_restricted_with_no_backend_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let (router, client) = test_router(dir.path()).await;

        let resp = router
            .dispatch(client, &req("set", json!({"key": "../etc/passwd", "value": "eA=="}), "r-3"))
            .await
            .unwrap();
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["error"]["code"], "RESTRICTED");

        let resp = router.dispatch(client, &req("exists", json!({"key": "../etc/passwd"}), "r-4")).await.unwrap();
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["error"]["code"], "RESTRICTED");
    }

    #[tokio::test]
    async fn duplicate_request_id_replays_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let (router, client) = test_router(dir.path()).await;

        let first = router.dispatch(client, &req("set", json!({"key": "a", "value": "eA=="}), "r-7")).await.unwrap();
        let second = router.dispatch(client, &req("set", json!({"key": "a", "value": "eA=="}), "r-7")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn burst_above_mps_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GatewayConfig::new(RawArgs {
            backend_url: None,
            namespace: Some("appA:".to_string()),
            relays: Some("wss://relay.example".to_string()),
            server_secret: Some(Keys::generate().secret_key().to_secret_hex()),
            encryption_pref: None,
            limit_mps: Some(2),
            limit_bps: Some(1_048_576),
            limit_max_key: Some(256),
            limit_max_val: Some(65_536),
            limit_mget_max: Some(16),
            registry_path: Some(dir.path().join("connections.json")),
            data_dir: Some(dir.path().to_path_buf()),
            log: None,
        })
        .unwrap();
        let registry = Arc::new(Registry::load(&cfg).await);
        let kv: Arc<dyn KvBackend> = Arc::new(FakeKv::default());
        let audit = Arc::new(AuditLog::new(cfg.server_secret.as_bytes()));
        let router = Router::new(registry, kv, audit, true, true);
        let client = Keys::generate().public_key();

        let r1 = router.dispatch(client, &req("get", json!({"key": "a"}), "a")).await.unwrap();
        let r2 = router.dispatch(client, &req("get", json!({"key": "a"}), "b")).await.unwrap();
        let r3 = router.dispatch(client, &req("get", json!({"key": "a"}), "c")).await.unwrap();

        let r1: Value = serde_json::from_slice(&r1).unwrap();
        let r2: Value = serde_json::from_slice(&r2).unwrap();
        let r3: Value = serde_json::from_slice(&r3).unwrap();
        assert!(r1.get("result").is_some());
        assert!(r2.get("result").is_some());
        assert_eq!(r3["error"]["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn mget_matches_individual_gets() {
        let dir = tempfile::tempdir().unwrap();
        let (router, client) = test_router(dir.path()).await;

        router.dispatch(client, &req("set", json!({"key": "user:123", "value": "SGVsbG8="}), "s-1")).await;
        let resp = router
            .dispatch(client, &req("mget", json!({"keys": ["user:123", "missing"]}), "m-1"))
            .await
            .unwrap();
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["result"]["values"], json!(["SGVsbG8=", null]));
    }

    #[tokio::test]
    async fn unknown_method_is_not_implemented_when_allowlisted_miss_first() {
        let dir = tempfile::tempdir().unwrap();
        let (router, client) = test_router(dir.path()).await;
        let resp = router.dispatch(client, &req("drop_table", json!({}), "x-1")).await.unwrap();
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["error"]["code"], "RESTRICTED");
    }

    #[tokio::test]
    async fn unparseable_request_is_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let (router, client) = test_router(dir.path()).await;
        let resp = router.dispatch(client, b"not json at all").await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn set_mirrors_audit_record_to_backend_list() {
        let dir = tempfile::tempdir().unwrap();
        let (router, client, fake) = test_router_with_kv(dir.path()).await;
        router
            .dispatch(client, &req("set", json!({"key": "user:123", "value": "SGVsbG8="}), "a-1"))
            .await
            .unwrap();

        // `persist_audit_record` is spawned off the request path; give it a
        // moment to land before inspecting the fake backend's list.
        for _ in 0..50 {
            if !fake.audit_pushes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let pushes = fake.audit_pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "appA:__audit");
        let record: Value = serde_json::from_str(&pushes[0].1).unwrap();
        assert_eq!(record["method"], "set");
        assert_eq!(record["status"], "ok");
    }
}
