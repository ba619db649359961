use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{StateStore, StoreError};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Redis-backed state store.
///
/// Operations retry transient broker errors with bounded exponential backoff;
/// a persistent failure surfaces as [`StoreError::Unavailable`] and is the
/// worker's cue to exit for the supervisor.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tracing::info!("Connected to state store");
        Ok(RedisStore { client, conn })
    }

    async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let mut backoff = BASE_BACKOFF;
        let mut last = None;
        for attempt in 0..MAX_ATTEMPTS {
            match op(self.conn.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt = attempt + 1, "Transient store error, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    last = Some(e);
                }
                Err(e) => return Err(StoreError::Unavailable(e.to_string())),
            }
        }
        Err(StoreError::Unavailable(
            last.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

fn is_transient(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_timeout() || e.is_cluster_error()
}

/// Redis rejects non-finite floats in score arguments unless spelled as
/// `-inf`/`+inf`.
fn score_bound(value: f64) -> String {
    if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if value == f64::INFINITY {
        "+inf".to_string()
    } else {
        value.to_string()
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.retry(move |mut conn| {
            let (key, member) = (key.clone(), member.clone());
            async move { conn.zadd::<_, _, _, ()>(key, member, score).await }
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.retry(move |mut conn| {
            let (key, member) = (key.clone(), member.clone());
            async move { conn.zrem::<_, _, ()>(key, member).await }
        })
        .await
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        let (min, max) = (score_bound(min), score_bound(max));
        self.retry(move |mut conn| {
            let (key, min, max) = (key.clone(), min.clone(), max.clone());
            async move { conn.zrangebyscore::<_, _, _, Vec<String>>(key, min, max).await }
        })
        .await
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let key = key.to_string();
        let popped = self
            .retry(move |mut conn| {
                let key = key.clone();
                async move { conn.zpopmin::<_, Vec<(String, f64)>>(key, 1).await }
            })
            .await?;
        Ok(popped.into_iter().next())
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.zcard::<_, u64>(key).await }
        })
        .await
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let key = key.to_string();
        let (min, max) = (score_bound(min), score_bound(max));
        self.retry(move |mut conn| {
            let (key, min, max) = (key.clone(), min.clone(), max.clone());
            async move { conn.zrembyscore::<_, _, _, u64>(key, min, max).await }
        })
        .await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let key = key.to_string();
        let members = members.to_vec();
        self.retry(move |mut conn| {
            let (key, members) = (key.clone(), members.clone());
            async move { conn.sadd::<_, _, u64>(key, members).await }
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.smembers::<_, Vec<String>>(key).await }
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.retry(move |mut conn| {
            let (key, member) = (key.clone(), member.clone());
            async move { conn.srem::<_, _, ()>(key, member).await }
        })
        .await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.retry(move |mut conn| {
            let (key, member) = (key.clone(), member.clone());
            async move { conn.sismember::<_, _, bool>(key, member).await }
        })
        .await
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.scard::<_, u64>(key).await }
        })
        .await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let key = key.to_string();
        let values = values.to_vec();
        self.retry(move |mut conn| {
            let (key, values) = (key.clone(), values.clone());
            async move { conn.rpush::<_, _, ()>(key, values).await }
        })
        .await
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        let count = NonZeroUsize::new(count.max(1));
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.lpop::<_, Vec<String>>(key, count).await }
        })
        .await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.llen::<_, u64>(key).await }
        })
        .await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.lrange::<_, Vec<String>>(key, start as isize, stop as isize).await }
        })
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.retry(move |mut conn| {
            let (key, field, value) = (key.clone(), field.clone(), value.clone());
            async move { conn.hset::<_, _, _, ()>(key, field, value).await }
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let (key, field) = (key.to_string(), field.to_string());
        self.retry(move |mut conn| {
            let (key, field) = (key.clone(), field.clone());
            async move { conn.hget::<_, _, Option<String>>(key, field).await }
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let (key, field) = (key.to_string(), field.to_string());
        self.retry(move |mut conn| {
            let (key, field) = (key.clone(), field.clone());
            async move { conn.hdel::<_, _, ()>(key, field).await }
        })
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        let reply = self
            .retry(move |mut conn| {
                let (key, value) = (key.clone(), value.clone());
                async move {
                    redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl_secs)
                        .query_async::<Option<String>>(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.get::<_, Option<String>>(key).await }
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.del::<_, ()>(key).await }
        })
        .await
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.incr::<_, _, i64>(key, by).await }
        })
        .await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let key = key.to_string();
        self.retry(move |mut conn| {
            let key = key.clone();
            async move { conn.expire::<_, ()>(key, ttl_secs as i64).await }
        })
        .await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let (channel, message) = (channel.to_string(), message.to_string());
        self.retry(move |mut conn| {
            let (channel, message) = (channel.clone(), message.clone());
            async move { conn.publish::<_, _, ()>(channel, message).await }
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}
