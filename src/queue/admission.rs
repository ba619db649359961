use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::JobScheduler;
use crate::models::{Plan, PlanPolicy, ScrapeJob};
use crate::store::{now_secs, StateStore, StoreError};

/// How long an active entry survives without a heartbeat before a crashed
/// worker's slot is reclaimed.
pub const STALL_TIMEOUT_SECS: u64 = 60;

/// A pending score packs `(priority, arrival)` into one float so equal
/// priorities dequeue FIFO: the integer part is the priority, the fractional
/// part a monotonically increasing sequence number.
const SEQ_STEP: f64 = 1e-9;

fn active_key(tenant_id: &str) -> String {
    format!("active:{tenant_id}")
}

fn pending_key(tenant_id: &str) -> String {
    format!("pending:{tenant_id}")
}

fn pending_seq_key(tenant_id: &str) -> String {
    format!("pending:{tenant_id}:seq")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    RunNow,
    Queued,
}

/// Per-tenant concurrency admission: an `active` sorted set scored by lease
/// expiry and a `pending` sorted set scored by priority. Admission decisions
/// for one tenant are serialized in-process; cross-process races can overshoot
/// the ceiling only within the stall window.
pub struct ConcurrencyManager {
    store: Arc<dyn StateStore>,
    scheduler: JobScheduler,
    policy: PlanPolicy,
    tenant_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConcurrencyManager {
    pub fn new(store: Arc<dyn StateStore>, scheduler: JobScheduler, policy: PlanPolicy) -> Self {
        ConcurrencyManager {
            store,
            scheduler,
            policy,
            tenant_locks: RwLock::new(HashMap::new()),
        }
    }

    async fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.tenant_locks.read().await;
            if let Some(lock) = locks.get(tenant_id) {
                return lock.clone();
            }
        }
        let mut locks = self.tenant_locks.write().await;
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Admit a job: run immediately if the tenant has a free slot, otherwise
    /// park it in the pending set at the given priority.
    pub async fn admit(&self, job: &ScrapeJob, priority: i32) -> Result<Admission, StoreError> {
        let lock = self.tenant_lock(&job.tenant_id).await;
        let _guard = lock.lock().await;

        let now = now_secs();
        self.sweep(&job.tenant_id, now).await?;

        self.scheduler.save_job(job).await?;

        let active = self.store.zcard(&active_key(&job.tenant_id)).await?;
        let limit = self.policy.concurrency_limit(job.plan) as u64;
        if active < limit {
            self.store
                .zadd(
                    &active_key(&job.tenant_id),
                    &job.job_id,
                    now + STALL_TIMEOUT_SECS as f64,
                )
                .await?;
            self.scheduler.push_ready(&job.job_id).await?;
            Ok(Admission::RunNow)
        } else {
            let seq = self.store.incr_by(&pending_seq_key(&job.tenant_id), 1).await?;
            let score = priority as f64 + seq as f64 * SEQ_STEP;
            self.store
                .zadd(&pending_key(&job.tenant_id), &job.job_id, score)
                .await?;
            Ok(Admission::Queued)
        }
    }

    /// Drop expired leases left behind by crashed workers.
    pub async fn sweep(&self, tenant_id: &str, now: f64) -> Result<u64, StoreError> {
        self.store
            .zremrangebyscore(&active_key(tenant_id), f64::NEG_INFINITY, now)
            .await
    }

    /// Heartbeat: push the job's lease expiry forward.
    pub async fn renew(&self, tenant_id: &str, job_id: &str) -> Result<(), StoreError> {
        self.store
            .zadd(
                &active_key(tenant_id),
                job_id,
                now_secs() + STALL_TIMEOUT_SECS as f64,
            )
            .await
    }

    /// Release the job's slot and pull pending work into the freed capacity.
    pub async fn complete(&self, tenant_id: &str, plan: Plan, job_id: &str) -> Result<(), StoreError> {
        self.store.zrem(&active_key(tenant_id), job_id).await?;
        self.promote(tenant_id, plan).await
    }

    /// Move pending jobs into active slots until the ceiling is reached or
    /// the pending set drains. Promoted jobs re-enter the scheduler.
    pub async fn promote(&self, tenant_id: &str, plan: Plan) -> Result<(), StoreError> {
        let lock = self.tenant_lock(tenant_id).await;
        let _guard = lock.lock().await;

        let limit = self.policy.concurrency_limit(plan) as u64;
        loop {
            let now = now_secs();
            self.sweep(tenant_id, now).await?;
            if self.store.zcard(&active_key(tenant_id)).await? >= limit {
                return Ok(());
            }
            let Some((job_id, _score)) = self.store.zpopmin(&pending_key(tenant_id)).await? else {
                return Ok(());
            };
            self.store
                .zadd(&active_key(tenant_id), &job_id, now + STALL_TIMEOUT_SECS as f64)
                .await?;
            self.scheduler.push_ready(&job_id).await?;
            tracing::debug!(tenant_id = %tenant_id, job_id = %job_id, "Promoted pending job");
        }
    }

    pub async fn active_count(&self, tenant_id: &str) -> Result<u64, StoreError> {
        self.store.zcard(&active_key(tenant_id)).await
    }

    pub async fn pending_count(&self, tenant_id: &str) -> Result<u64, StoreError> {
        self.store.zcard(&pending_key(tenant_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InternalOptions, JobMode, ScrapeOptions};
    use crate::store::MemoryStore;

    fn manager(store: Arc<MemoryStore>) -> ConcurrencyManager {
        let scheduler = JobScheduler::new(store.clone());
        ConcurrencyManager::new(
            store,
            scheduler,
            PlanPolicy {
                enterprise_concurrency: 200,
            },
        )
    }

    fn job(id: &str, plan: Plan) -> ScrapeJob {
        ScrapeJob {
            job_id: id.to_string(),
            url: "https://example.com/".to_string(),
            mode: JobMode::Single,
            tenant_id: "team-1".to_string(),
            plan,
            crawl_id: None,
            scrape_options: ScrapeOptions::default(),
            internal_options: InternalOptions::default(),
            origin: "api".to_string(),
            webhook: None,
            depth: 0,
        }
    }

    #[tokio::test]
    async fn test_admit_under_ceiling_runs_now() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);
        let admission = manager.admit(&job("a", Plan::Free), 10).await.unwrap();
        assert_eq!(admission, Admission::RunNow);
        assert_eq!(manager.active_count("team-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_admit_over_ceiling_queues() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);
        // free plan ceiling is 2
        for id in ["a", "b"] {
            assert_eq!(
                manager.admit(&job(id, Plan::Free), 10).await.unwrap(),
                Admission::RunNow
            );
        }
        assert_eq!(
            manager.admit(&job("c", Plan::Free), 10).await.unwrap(),
            Admission::Queued
        );
        assert_eq!(manager.active_count("team-1").await.unwrap(), 2);
        assert_eq!(manager.pending_count("team-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_complete_promotes_fifo_within_priority() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = JobScheduler::new(store.clone());
        let manager = manager(store.clone());

        for id in ["a", "b", "c", "d", "e"] {
            manager.admit(&job(id, Plan::Free), 10).await.unwrap();
        }
        // Drain the two immediately admitted jobs.
        assert_eq!(scheduler.claim(60).await.unwrap().unwrap().job_id, "a");
        assert_eq!(scheduler.claim(60).await.unwrap().unwrap().job_id, "b");

        manager.complete("team-1", Plan::Free, "a").await.unwrap();
        assert_eq!(scheduler.claim(60).await.unwrap().unwrap().job_id, "c");
        manager.complete("team-1", Plan::Free, "b").await.unwrap();
        assert_eq!(scheduler.claim(60).await.unwrap().unwrap().job_id, "d");
        manager.complete("team-1", Plan::Free, "c").await.unwrap();
        assert_eq!(scheduler.claim(60).await.unwrap().unwrap().job_id, "e");
    }

    #[tokio::test]
    async fn test_higher_priority_jumps_queue() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = JobScheduler::new(store.clone());
        let manager = manager(store.clone());

        for id in ["a", "b"] {
            manager.admit(&job(id, Plan::Free), 10).await.unwrap();
        }
        manager.admit(&job("low", Plan::Free), 20).await.unwrap();
        manager.admit(&job("high", Plan::Free), 10).await.unwrap();

        scheduler.claim(60).await.unwrap();
        scheduler.claim(60).await.unwrap();
        manager.complete("team-1", Plan::Free, "a").await.unwrap();
        assert_eq!(scheduler.claim(60).await.unwrap().unwrap().job_id, "high");
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_lease_and_promotes() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());

        for id in ["a", "b"] {
            manager.admit(&job(id, Plan::Free), 10).await.unwrap();
        }
        manager.admit(&job("c", Plan::Free), 10).await.unwrap();
        assert_eq!(manager.pending_count("team-1").await.unwrap(), 1);

        // Simulate worker death: rewind "a"'s lease into the past.
        store.zadd("active:team-1", "a", 0.0).await.unwrap();
        manager.promote("team-1", Plan::Free).await.unwrap();

        assert_eq!(manager.active_count("team-1").await.unwrap(), 2);
        assert_eq!(manager.pending_count("team-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());
        manager.admit(&job("a", Plan::Free), 10).await.unwrap();

        // Expire it, renew, then verify the sweep no longer removes it.
        store.zadd("active:team-1", "a", 0.0).await.unwrap();
        manager.renew("team-1", "a").await.unwrap();
        manager.sweep("team-1", now_secs()).await.unwrap();
        assert_eq!(manager.active_count("team-1").await.unwrap(), 1);
    }
}
