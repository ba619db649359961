use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use super::{StateStore, StoreError};

/// In-memory state store with Redis-compatible semantics.
///
/// Used by tests and single-node development runs. Sorted-set pops order by
/// `(score, member)`, `sadd` reports newly inserted members, and TTLs are
/// enforced lazily on access, matching what the production adapter observes.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    zsets: HashMap<String, BTreeMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    expiries: HashMap<String, Instant>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn purge(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if *deadline <= Instant::now() {
                self.expiries.remove(key);
                self.zsets.remove(key);
                self.sets.remove(key);
                self.lists.remove(key);
                self.hashes.remove(key);
                self.strings.remove(key);
            }
        }
    }

    fn remove_all(&mut self, key: &str) {
        self.expiries.remove(key);
        self.zsets.remove(key);
        self.sets.remove(key);
        self.lists.remove(key);
        self.hashes.remove(key);
        self.strings.remove(key);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        if let Some(zset) = inner.zsets.get_mut(key) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let mut matched: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|zset| {
                zset.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        matched.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(matched.into_iter().map(|(member, _)| member).collect())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let popped = inner.zsets.get(key).and_then(|zset| {
            zset.iter()
                .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
                .map(|(member, score)| (member.clone(), *score))
        });
        if let Some((member, _)) = &popped {
            if let Some(zset) = inner.zsets.get_mut(key) {
                zset.remove(member);
            }
        }
        Ok(popped)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let mut removed = 0;
        if let Some(zset) = inner.zsets.get_mut(key) {
            let doomed: Vec<String> = zset
                .iter()
                .filter(|(_, score)| **score >= min && **score <= max)
                .map(|(member, _)| member.clone())
                .collect();
            removed = doomed.len() as u64;
            for member in doomed {
                zset.remove(&member);
            }
        }
        Ok(removed)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let set = inner.sets.entry(key.to_string()).or_default();
        let mut inserted = 0;
        for member in members {
            if set.insert(member.clone()) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let list = inner.lists.entry(key.to_string()).or_default();
        for value in values {
            list.push_back(value.clone());
        }
        Ok(())
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let mut popped = Vec::new();
        if let Some(list) = inner.lists.get_mut(key) {
            for _ in 0..count.max(1) {
                match list.pop_front() {
                    Some(value) => popped.push(value),
                    None => break,
                }
            }
        }
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let clamp = |index: i64| -> usize {
            let absolute = if index < 0 { len + index } else { index };
            absolute.clamp(0, len) as usize
        };
        let (start, stop) = (clamp(start), clamp(stop).min(len.saturating_sub(1) as usize));
        if list.is_empty() || start > stop {
            return Ok(Vec::new());
        }
        Ok(list.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_string(), value.to_string());
        inner
            .expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.remove_all(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let current: i64 = inner
            .strings
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let next = current + by;
        inner.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(sender) = inner.channels.get(channel) {
            // No subscribers is not an error, same as Redis.
            let _ = sender.send(message.to_string());
        } else {
            let (sender, _) = broadcast::channel(128);
            let _ = sender.send(message.to_string());
            inner.channels.insert(channel.to_string(), sender);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let sender = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(128).0);
        let stream = BroadcastStream::new(sender.subscribe())
            .filter_map(|message| async move { message.ok() });
        Ok(stream.boxed())
    }
}
