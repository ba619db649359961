pub mod robots;
pub mod sitemap;
pub mod url;

use std::sync::Arc;

use self::url::{normalize_url, permutations};
use crate::models::{Crawl, CrawlStatusKind, CrawlerOptions};
use crate::store::{StateStore, StoreError};

/// Crawl bookkeeping keys expire a day after finalization.
const CRAWL_TTL_SECS: u64 = 24 * 60 * 60;

fn crawl_key(crawl_id: &str) -> String {
    format!("crawl:{crawl_id}")
}

fn visited_key(crawl_id: &str) -> String {
    format!("crawl:{crawl_id}:visited")
}

fn visited_unique_key(crawl_id: &str) -> String {
    format!("crawl:{crawl_id}:visited_unique")
}

fn jobs_key(crawl_id: &str) -> String {
    format!("crawl:{crawl_id}:jobs")
}

fn done_key(crawl_id: &str) -> String {
    format!("crawl:{crawl_id}:jobs_done")
}

fn done_success_key(crawl_id: &str) -> String {
    format!("crawl:{crawl_id}:jobs_done_success")
}

fn kickoff_key(crawl_id: &str) -> String {
    format!("crawl:{crawl_id}:kickoff_finished")
}

fn finished_key(crawl_id: &str) -> String {
    format!("crawl:{crawl_id}:finished")
}

/// Shared-store view of a crawl: the record itself, URL deduplication sets,
/// enrolled jobs, completion counters, and the finalization guard.
#[derive(Clone)]
pub struct CrawlRegistry {
    store: Arc<dyn StateStore>,
}

impl CrawlRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        CrawlRegistry { store }
    }

    pub async fn save_crawl(&self, crawl: &Crawl) -> Result<(), StoreError> {
        let payload = serde_json::to_string(crawl)
            .map_err(|e| StoreError::Unavailable(format!("serialize crawl: {e}")))?;
        self.store
            .hset(&crawl_key(&crawl.crawl_id), "record", &payload)
            .await
    }

    pub async fn get_crawl(&self, crawl_id: &str) -> Result<Option<Crawl>, StoreError> {
        let Some(payload) = self.store.hget(&crawl_key(crawl_id), "record").await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Crawl>(&payload) {
            Ok(mut crawl) => {
                // The cancel flag is written out-of-band of the record.
                crawl.cancelled = self.is_cancelled(crawl_id).await?;
                Ok(Some(crawl))
            }
            Err(e) => {
                tracing::warn!(crawl_id = %crawl_id, error = %e, "Undecodable crawl record");
                Ok(None)
            }
        }
    }

    pub async fn cancel(&self, crawl_id: &str) -> Result<(), StoreError> {
        self.store.hset(&crawl_key(crawl_id), "cancelled", "1").await
    }

    pub async fn is_cancelled(&self, crawl_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .hget(&crawl_key(crawl_id), "cancelled")
            .await?
            .is_some())
    }

    /// Claim a URL for this crawl. The whole permutation bundle is inserted
    /// in one `sadd`; the URL is ours iff every permutation was new. Losing
    /// means another job already owns some form of this URL.
    pub async fn lock_url(
        &self,
        crawl_id: &str,
        url: &str,
        options: &CrawlerOptions,
    ) -> Result<bool, StoreError> {
        let Some(canonical) = normalize_url(url, options) else {
            return Ok(false);
        };
        let bundle = permutations(&canonical);
        let inserted = self.store.sadd(&visited_key(crawl_id), &bundle).await?;
        let locked = inserted == bundle.len() as u64;
        if locked {
            self.store
                .sadd(&visited_unique_key(crawl_id), &[canonical])
                .await?;
        }
        Ok(locked)
    }

    /// Batch variant: returns the job ids whose URL was successfully locked.
    pub async fn lock_urls_individually(
        &self,
        crawl_id: &str,
        candidates: &[(String, String)],
        options: &CrawlerOptions,
    ) -> Result<Vec<String>, StoreError> {
        let mut locked = Vec::new();
        for (job_id, url) in candidates {
            if self.lock_url(crawl_id, url, options).await? {
                locked.push(job_id.clone());
            }
        }
        Ok(locked)
    }

    pub async fn add_crawl_job(&self, crawl_id: &str, job_id: &str) -> Result<(), StoreError> {
        self.store
            .rpush(&jobs_key(crawl_id), &[job_id.to_string()])
            .await
    }

    pub async fn add_crawl_jobs(&self, crawl_id: &str, job_ids: &[String]) -> Result<(), StoreError> {
        self.store.rpush(&jobs_key(crawl_id), job_ids).await
    }

    pub async fn job_ids(&self, crawl_id: &str) -> Result<Vec<String>, StoreError> {
        self.store.lrange(&jobs_key(crawl_id), 0, -1).await
    }

    pub async fn enrolled_count(&self, crawl_id: &str) -> Result<u64, StoreError> {
        self.store.llen(&jobs_key(crawl_id)).await
    }

    /// Count a job as terminal. Returns the total done so far.
    pub async fn add_done(
        &self,
        crawl_id: &str,
        job_id: &str,
        success: bool,
    ) -> Result<u64, StoreError> {
        let done = self.store.incr_by(&done_key(crawl_id), 1).await?;
        if success {
            self.store.incr_by(&done_success_key(crawl_id), 1).await?;
        }
        tracing::debug!(crawl_id = %crawl_id, job_id = %job_id, done, success, "Crawl job done");
        Ok(done as u64)
    }

    pub async fn done_count(&self, crawl_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .store
            .get(&done_key(crawl_id))
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    pub async fn success_count(&self, crawl_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .store
            .get(&done_success_key(crawl_id))
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    pub async fn finish_kickoff(&self, crawl_id: &str) -> Result<(), StoreError> {
        self.store
            .set_nx_ex(&kickoff_key(crawl_id), "1", CRAWL_TTL_SECS)
            .await?;
        Ok(())
    }

    pub async fn is_kickoff_finished(&self, crawl_id: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(&kickoff_key(crawl_id)).await?.is_some())
    }

    /// Atomic check-and-mark-finished. At most one caller across all workers
    /// ever sees `true`; everyone may call it repeatedly and at any time.
    pub async fn try_finalize(&self, crawl_id: &str) -> Result<bool, StoreError> {
        if !self.is_kickoff_finished(crawl_id).await? {
            return Ok(false);
        }
        let enrolled = self.enrolled_count(crawl_id).await?;
        let done = self.done_count(crawl_id).await?;
        if done < enrolled {
            return Ok(false);
        }
        let won = self
            .store
            .set_nx_ex(&finished_key(crawl_id), "1", CRAWL_TTL_SECS)
            .await?;
        if won {
            for key in [
                visited_key(crawl_id),
                visited_unique_key(crawl_id),
                jobs_key(crawl_id),
                done_key(crawl_id),
                done_success_key(crawl_id),
            ] {
                self.store.expire(&key, CRAWL_TTL_SECS).await?;
            }
            tracing::info!(crawl_id = %crawl_id, enrolled, "Crawl finalized");
        }
        Ok(won)
    }

    pub async fn is_finished(&self, crawl_id: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(&finished_key(crawl_id)).await?.is_some())
    }

    /// Status as exposed by the polling surface, derived from
    /// `(cancelled, finished, kickoff_finished, done, enrolled)`.
    pub async fn status(&self, crawl_id: &str) -> Result<CrawlStatusKind, StoreError> {
        if self.is_cancelled(crawl_id).await? {
            return Ok(CrawlStatusKind::Cancelled);
        }
        if self.is_finished(crawl_id).await? {
            let done = self.done_count(crawl_id).await?;
            let succeeded = self.success_count(crawl_id).await?;
            if done > 0 && succeeded == 0 {
                return Ok(CrawlStatusKind::Failed);
            }
            return Ok(CrawlStatusKind::Completed);
        }
        if !self.is_kickoff_finished(crawl_id).await? && self.enrolled_count(crawl_id).await? == 0 {
            return Ok(CrawlStatusKind::Pending);
        }
        Ok(CrawlStatusKind::Scraping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlKind, InternalOptions, Plan, ScrapeOptions};
    use crate::store::MemoryStore;

    fn registry() -> CrawlRegistry {
        CrawlRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn crawl(id: &str) -> Crawl {
        Crawl {
            crawl_id: id.to_string(),
            origin_url: "https://site.test/".to_string(),
            tenant_id: "team-1".to_string(),
            plan: Plan::Standard,
            kind: CrawlKind::Crawl,
            seed_urls: Vec::new(),
            crawler_options: CrawlerOptions::default(),
            scrape_options: ScrapeOptions::default(),
            internal_options: InternalOptions::default(),
            robots_txt: None,
            created_at: 0,
            cancelled: false,
            webhook: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_crawl() {
        let registry = registry();
        registry.save_crawl(&crawl("c1")).await.unwrap();
        let loaded = registry.get_crawl("c1").await.unwrap().unwrap();
        assert_eq!(loaded.origin_url, "https://site.test/");
        assert!(!loaded.cancelled);
    }

    #[tokio::test]
    async fn test_cancel_flag_survives_record_reload() {
        let registry = registry();
        registry.save_crawl(&crawl("c1")).await.unwrap();
        registry.cancel("c1").await.unwrap();
        let loaded = registry.get_crawl("c1").await.unwrap().unwrap();
        assert!(loaded.cancelled);
    }

    #[tokio::test]
    async fn test_lock_url_twice() {
        let registry = registry();
        let options = CrawlerOptions::default();
        assert!(registry
            .lock_url("c1", "https://site.test/page", &options)
            .await
            .unwrap());
        assert!(!registry
            .lock_url("c1", "https://site.test/page", &options)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_lock_url_dedupes_permutations() {
        let registry = registry();
        let options = CrawlerOptions::default();
        assert!(registry
            .lock_url("c1", "https://site.test/page", &options)
            .await
            .unwrap());
        // A trivially different form of the same page loses.
        assert!(!registry
            .lock_url("c1", "http://www.site.test/page/", &options)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_lock_urls_individually_returns_winners() {
        let registry = registry();
        let options = CrawlerOptions::default();
        registry
            .lock_url("c1", "https://site.test/a", &options)
            .await
            .unwrap();
        let candidates = vec![
            ("j1".to_string(), "https://site.test/a".to_string()),
            ("j2".to_string(), "https://site.test/b".to_string()),
        ];
        let locked = registry
            .lock_urls_individually("c1", &candidates, &options)
            .await
            .unwrap();
        assert_eq!(locked, vec!["j2".to_string()]);
    }

    #[tokio::test]
    async fn test_try_finalize_requires_kickoff_and_done() {
        let registry = registry();
        registry.add_crawl_job("c1", "j1").await.unwrap();
        assert!(!registry.try_finalize("c1").await.unwrap());

        registry.finish_kickoff("c1").await.unwrap();
        assert!(!registry.try_finalize("c1").await.unwrap());

        registry.add_done("c1", "j1", true).await.unwrap();
        assert!(registry.try_finalize("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_try_finalize_single_winner() {
        let registry = registry();
        registry.add_crawl_job("c1", "j1").await.unwrap();
        registry.finish_kickoff("c1").await.unwrap();
        registry.add_done("c1", "j1", true).await.unwrap();

        let first = registry.try_finalize("c1").await.unwrap();
        let second = registry.try_finalize("c1").await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_status_derivation() {
        let registry = registry();
        registry.save_crawl(&crawl("c1")).await.unwrap();
        assert_eq!(registry.status("c1").await.unwrap(), CrawlStatusKind::Pending);

        registry.add_crawl_job("c1", "j1").await.unwrap();
        assert_eq!(registry.status("c1").await.unwrap(), CrawlStatusKind::Scraping);

        registry.finish_kickoff("c1").await.unwrap();
        registry.add_done("c1", "j1", true).await.unwrap();
        registry.try_finalize("c1").await.unwrap();
        assert_eq!(
            registry.status("c1").await.unwrap(),
            CrawlStatusKind::Completed
        );
    }

    #[tokio::test]
    async fn test_status_failed_when_every_child_failed() {
        let registry = registry();
        registry.save_crawl(&crawl("c1")).await.unwrap();
        registry.add_crawl_job("c1", "j1").await.unwrap();
        registry.finish_kickoff("c1").await.unwrap();
        registry.add_done("c1", "j1", false).await.unwrap();
        registry.try_finalize("c1").await.unwrap();
        assert_eq!(registry.status("c1").await.unwrap(), CrawlStatusKind::Failed);
    }

    #[tokio::test]
    async fn test_status_cancelled_wins() {
        let registry = registry();
        registry.save_crawl(&crawl("c1")).await.unwrap();
        registry.cancel("c1").await.unwrap();
        assert_eq!(
            registry.status("c1").await.unwrap(),
            CrawlStatusKind::Cancelled
        );
    }
}
