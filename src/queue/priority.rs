use std::sync::Arc;

use crate::models::Plan;
use crate::store::{StateStore, StoreError};

// Base priorities by job provenance; lower score runs sooner.
pub const BASE_SITEMAP_DISCOVERED: i32 = 20;
pub const BASE_LINK_DISCOVERED: i32 = 20;
pub const BASE_KICKOFF: i32 = 15;
pub const BASE_SINGLE_SCRAPE: i32 = 10;

/// TTL for the in-flight tracking set; counts decay when a tenant stops
/// enqueueing.
const INFLIGHT_TTL_SECS: u64 = 60;

fn jobprio_key(tenant_id: &str) -> String {
    format!("jobprio:{tenant_id}")
}

/// Penalty ramp per plan: no penalty below the threshold, then a linear climb.
/// The constants are fixed for reproducible scheduling.
fn ramp(plan: Plan) -> Option<(u64, f64)> {
    match plan {
        Plan::Free => Some((25, 0.5)),
        Plan::Hobby => Some((50, 0.3)),
        Plan::Standard => Some((200, 0.4)),
        Plan::Growth | Plan::Scale => Some((400, 0.1)),
        Plan::Enterprise | Plan::System => None,
    }
}

pub fn penalty(plan: Plan, inflight: u64) -> i32 {
    match ramp(plan) {
        Some((threshold, slope)) if inflight > threshold => {
            ((inflight - threshold) as f64 * slope).ceil() as i32
        }
        _ => 0,
    }
}

/// Computes the dynamic priority score stored with each job at enqueue time.
#[derive(Clone)]
pub struct PriorityScorer {
    store: Arc<dyn StateStore>,
}

impl PriorityScorer {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        PriorityScorer { store }
    }

    /// Record the job in the tenant's in-flight set and return its score.
    pub async fn score_for_enqueue(
        &self,
        tenant_id: &str,
        plan: Plan,
        job_id: &str,
        base_priority: i32,
    ) -> Result<i32, StoreError> {
        let key = jobprio_key(tenant_id);
        self.store.sadd(&key, &[job_id.to_string()]).await?;
        self.store.expire(&key, INFLIGHT_TTL_SECS).await?;
        let inflight = self.store.scard(&key).await?;
        Ok(base_priority + penalty(plan, inflight))
    }
}
