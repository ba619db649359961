pub mod admission;
pub mod priority;

use std::sync::Arc;

use crate::models::{Document, JobState, ScrapeJob};
use crate::store::{now_secs, StateStore, StoreError};

/// Maximum times a job may stall (lease expired without a heartbeat) before
/// it is failed outright.
pub const MAX_STALL_RETRIES: i64 = 10;

const READY_KEY: &str = "queue:ready";
const PROCESSING_KEY: &str = "queue:processing";

fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}

/// Broker-side job bookkeeping: serialized payloads, the ready list workers
/// drain, and the processing set scored by lease expiry so stalled jobs can
/// be re-delivered.
#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn StateStore>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        JobScheduler { store }
    }

    pub async fn save_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job)
            .map_err(|e| StoreError::Unavailable(format!("serialize job: {e}")))?;
        let key = job_key(&job.job_id);
        self.store.hset(&key, "data", &payload).await?;
        self.set_state(&job.job_id, JobState::Pending).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<ScrapeJob>, StoreError> {
        let Some(payload) = self.store.hget(&job_key(job_id), "data").await? else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Dropping undecodable job payload");
                Ok(None)
            }
        }
    }

    pub async fn set_state(&self, job_id: &str, state: JobState) -> Result<(), StoreError> {
        let value = serde_json::to_string(&state).unwrap_or_default();
        self.store.hset(&job_key(job_id), "state", &value).await
    }

    pub async fn state(&self, job_id: &str) -> Result<Option<JobState>, StoreError> {
        let Some(value) = self.store.hget(&job_key(job_id), "state").await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&value).ok())
    }

    pub async fn push_ready(&self, job_id: &str) -> Result<(), StoreError> {
        self.store.rpush(READY_KEY, &[job_id.to_string()]).await
    }

    /// Claim the next ready job under a fresh lease. Jobs whose payload has
    /// vanished (TTL'd or corrupt) are skipped.
    pub async fn claim(&self, lease_secs: u64) -> Result<Option<ScrapeJob>, StoreError> {
        loop {
            let popped = self.store.lpop(READY_KEY, 1).await?;
            let Some(job_id) = popped.into_iter().next() else {
                return Ok(None);
            };
            if let Some(job) = self.get_job(&job_id).await? {
                self.store
                    .zadd(PROCESSING_KEY, &job_id, now_secs() + lease_secs as f64)
                    .await?;
                self.set_state(&job_id, JobState::Active).await?;
                return Ok(Some(job));
            }
        }
    }

    /// Heartbeat path: push the broker-side lease expiry forward.
    pub async fn extend_lease(&self, job_id: &str, lease_secs: u64) -> Result<(), StoreError> {
        self.store
            .zadd(PROCESSING_KEY, job_id, now_secs() + lease_secs as f64)
            .await
    }

    pub async fn release(&self, job_id: &str) -> Result<(), StoreError> {
        self.store.zrem(PROCESSING_KEY, job_id).await
    }

    pub async fn store_result(&self, job_id: &str, document: &Document) -> Result<(), StoreError> {
        let payload = serde_json::to_string(document)
            .map_err(|e| StoreError::Unavailable(format!("serialize document: {e}")))?;
        self.store.hset(&job_key(job_id), "result", &payload).await
    }

    pub async fn result(&self, job_id: &str) -> Result<Option<Document>, StoreError> {
        let Some(payload) = self.store.hget(&job_key(job_id), "result").await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&payload).ok())
    }

    pub async fn record_error(&self, job_id: &str, message: &str) -> Result<(), StoreError> {
        self.store.hset(&job_key(job_id), "error", message).await
    }

    pub async fn error(&self, job_id: &str) -> Result<Option<String>, StoreError> {
        self.store.hget(&job_key(job_id), "error").await
    }

    /// Move jobs whose lease expired back to the ready list, failing any job
    /// that has exhausted its stall budget. Any worker may run this; it is
    /// idempotent per job because the processing entry is removed first.
    pub async fn reap_stalled(&self) -> Result<u64, StoreError> {
        let expired = self
            .store
            .zrangebyscore(PROCESSING_KEY, f64::NEG_INFINITY, now_secs())
            .await?;
        let mut redelivered = 0;
        for job_id in expired {
            self.store.zrem(PROCESSING_KEY, &job_id).await?;
            let stalls = self
                .store
                .incr_by(&format!("{}:stalls", job_key(&job_id)), 1)
                .await?;
            if stalls > MAX_STALL_RETRIES {
                tracing::warn!(job_id = %job_id, stalls, "Job exceeded stall budget, failing");
                self.set_state(&job_id, JobState::Failed).await?;
                self.record_error(&job_id, "job stalled too many times").await?;
            } else {
                tracing::info!(job_id = %job_id, stalls, "Re-delivering stalled job");
                self.set_state(&job_id, JobState::Pending).await?;
                self.push_ready(&job_id).await?;
            }
            redelivered += 1;
        }
        Ok(redelivered)
    }
}
