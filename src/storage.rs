use anyhow::Result;
use async_trait::async_trait;

/// Response cache for remote lookups. `now` and `expires_at` are epoch seconds.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_cache(&self, key: &str, now: i64) -> Result<Option<String>>;
    async fn put_cache(&self, key: &str, payload: &str, expires_at: i64) -> Result<()>;
    async fn purge_expired_cache(&self, now: i64) -> Result<u64>;
}
