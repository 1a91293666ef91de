//! KV Adapter (C10) — thin wrapper over the backend store providing the
//! eight primitives (§4.9), grounded on `daemon/src/storage/mod.rs`'s
//! one-method-per-operation style, translated from SQLite to Redis since
//! the spec's backend is explicitly a Redis-compatible store.
//!
//! Transient-error retry reuses `retry.rs`'s `retry_with_backoff` verbatim —
//! it already implements exactly the "3 in-call retries, small backoff"
//! policy this component needs.

use crate::retry::{retry_with_backoff, RetryConfig};
use anyhow::Result;
use redis::AsyncCommands;

#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<u64>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;
    async fn expire(&self, key: &str, ttl: u64) -> Result<bool>;
    async fn ttl(&self, key: &str) -> Result<i64>;
    /// Push a JSON audit record onto a bounded list (§6: audit list lives at
    /// `<namespace>__audit`, head-pushed, trimmed at 10 000 entries).
    async fn audit_push(&self, list_key: &str, record_json: &str, max_len: isize) -> Result<()>;
    fn is_ready(&self) -> bool;
}

pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
    retry: RetryConfig,
}

impl RedisKv {
    pub async fn connect(backend_url: &str) -> Result<Self> {
        let client = redis::Client::open(backend_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            retry: RetryConfig::default(),
        })
    }
}

#[async_trait::async_trait]
impl KvBackend for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        retry_with_backoff(&self.retry, || {
            let mut conn = self.manager.clone();
            let key = key.clone();
            async move { conn.get::<_, Option<Vec<u8>>>(&key).await }
        })
        .await
        .map_err(Into::into)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<()> {
        let key = key.to_string();
        let value = value.to_vec();
        retry_with_backoff(&self.retry, || {
            let mut conn = self.manager.clone();
            let key = key.clone();
            let value = value.clone();
            async move {
                match ttl {
                    Some(secs) => conn.set_ex::<_, _, ()>(&key, value, secs).await,
                    None => conn.set::<_, _, ()>(&key, value).await,
                }
            }
        })
        .await
        .map_err(Into::into)
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        retry_with_backoff(&self.retry, || {
            let mut conn = self.manager.clone();
            let key = key.clone();
            async move { conn.del::<_, u64>(&key).await }
        })
        .await
        .map_err(Into::into)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        retry_with_backoff(&self.retry, || {
            let mut conn = self.manager.clone();
            let key = key.clone();
            async move { conn.exists::<_, bool>(&key).await }
        })
        .await
        .map_err(Into::into)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = keys.to_vec();
        retry_with_backoff(&self.retry, || {
            let mut conn = self.manager.clone();
            let keys = keys.clone();
            async move { conn.mget::<_, Vec<Option<Vec<u8>>>>(&keys).await }
        })
        .await
        .map_err(Into::into)
    }

    async fn expire(&self, key: &str, ttl: u64) -> Result<bool> {
        let key = key.to_string();
        retry_with_backoff(&self.retry, || {
            let mut conn = self.manager.clone();
            let key = key.clone();
            async move { conn.expire::<_, bool>(&key, ttl as i64).await }
        })
        .await
        .map_err(Into::into)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let key = key.to_string();
        let reply: redis::IntegerReplyOrNoOp = retry_with_backoff(&self.retry, || {
            let mut conn = self.manager.clone();
            let key = key.clone();
            async move { conn.ttl(&key).await }
        })
        .await?;
        Ok(reply.raw() as i64)
    }

    async fn audit_push(&self, list_key: &str, record_json: &str, max_len: isize) -> Result<()> {
        let list_key = list_key.to_string();
        let record_json = record_json.to_string();
        retry_with_backoff(&self.retry, || {
            let mut conn = self.manager.clone();
            let list_key = list_key.clone();
            let record_json = record_json.clone();
            async move {
                let _: () = conn.lpush(&list_key, record_json).await?;
                conn.ltrim(&list_key, 0, max_len - 1).await
            }
        })
        .await
        .map_err(Into::into)
    }

    fn is_ready(&self) -> bool {
        true
    }
}
