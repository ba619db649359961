pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Typed view over the shared key-value/queue primitives.
///
/// Every component that persists state goes through this trait, so tests can
/// substitute [`MemoryStore`] for the Redis-backed production adapter. Sorted
/// sets order by `(score, member)` the way Redis does; `sadd` reports how many
/// members were newly inserted, which is the atomic primitive crawl
/// deduplication is built on.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Sorted sets
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError>;
    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>, StoreError>;
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    // Sets
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn scard(&self, key: &str) -> Result<u64, StoreError>;

    // Lists
    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), StoreError>;
    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError>;
    async fn llen(&self, key: &str) -> Result<u64, StoreError>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    // Hashes
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    // Strings and counters
    /// `SET key value EX ttl NX`; returns whether the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StoreError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    // Pub/sub
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError>;
}

/// Seconds since the Unix epoch, as the shared clock for lease scores.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
