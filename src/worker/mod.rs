use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::crawl::robots::{RobotsChecker, RobotsProvider};
use crate::crawl::sitemap::SitemapProvider;
use crate::crawl::url::{normalize_url, LinkFilter};
use crate::crawl::CrawlRegistry;
use crate::error::ScrapeError;
use crate::models::{
    Crawl, CrawlKind, InternalOptions, JobMode, JobState, ScrapeJob, WebhookEvent,
};
use crate::pipeline::{ScrapePipeline, TransformedPage};
use crate::queue::admission::ConcurrencyManager;
use crate::queue::priority::{
    PriorityScorer, BASE_KICKOFF, BASE_LINK_DISCOVERED, BASE_SINGLE_SCRAPE,
    BASE_SITEMAP_DISCOVERED,
};
use crate::queue::JobScheduler;
use crate::store::{StateStore, StoreError};
use crate::webhook::WebhookNotifier;

/// Channel worker liveness signals are published on.
pub const LIVENESS_CHANNEL: &str = "scrapeloop:liveness";

/// Consecutive resource-gate failures before the worker reports itself
/// stalled.
const STALL_STRIKES_BEFORE_SIGNAL: u32 = 5;

/// Everything a worker needs, wired once at startup and shared.
pub struct WorkerServices {
    pub store: Arc<dyn StateStore>,
    pub scheduler: JobScheduler,
    pub admission: Arc<ConcurrencyManager>,
    pub scorer: PriorityScorer,
    pub registry: CrawlRegistry,
    pub pipeline: ScrapePipeline,
    pub webhooks: WebhookNotifier,
    pub robots: Arc<dyn RobotsProvider>,
    pub sitemaps: Arc<dyn SitemapProvider>,
    pub config: Arc<Config>,
}

/// A single queue worker: claims jobs, runs them with a heartbeat, and feeds
/// completion back into admission and the crawl registry.
pub struct Worker {
    id: String,
    services: Arc<WorkerServices>,
    system: System,
}

impl Worker {
    pub fn new(id: String, services: Arc<WorkerServices>) -> Self {
        Worker {
            id,
            services,
            system: System::new(),
        }
    }

    /// Main loop. Returns `Ok(())` on graceful shutdown; a store error exits
    /// the loop so the supervisor can restart the process.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), StoreError> {
        tracing::info!(worker_id = %self.id, "Worker started");
        let mut stall_strikes: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(worker_id = %self.id, "Worker draining, shutting down");
                return Ok(());
            }

            if !self.resources_ok() {
                stall_strikes += 1;
                if stall_strikes >= STALL_STRIKES_BEFORE_SIGNAL {
                    let signal = serde_json::json!({
                        "worker_id": self.id,
                        "signal": "worker_stalled",
                    })
                    .to_string();
                    let _ = self.services.store.publish(LIVENESS_CHANNEL, &signal).await;
                }
                let backoff = Duration::from_millis(self.services.config.resource_backoff_ms);
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }
            stall_strikes = 0;

            self.services.scheduler.reap_stalled().await?;

            let lease = self.services.config.lease_extension_secs;
            match self.services.scheduler.claim(lease).await? {
                Some(job) => self.process_job(job).await?,
                None => {
                    let poll = Duration::from_millis(self.services.config.poll_interval_ms);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }
    }

    fn resources_ok(&mut self) -> bool {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let cpu = self.system.global_cpu_usage() / 100.0;
        let memory = if self.system.total_memory() > 0 {
            self.system.used_memory() as f32 / self.system.total_memory() as f32
        } else {
            0.0
        };
        let config = &self.services.config;
        if cpu >= config.max_cpu_utilization || memory >= config.max_memory_utilization {
            tracing::warn!(
                worker_id = %self.id,
                cpu,
                memory,
                "Resource pressure, deferring job claim"
            );
            return false;
        }
        true
    }

    /// Run one claimed job: heartbeat alongside the work, then report the
    /// outcome everywhere it needs to go.
    async fn process_job(&self, job: ScrapeJob) -> Result<(), StoreError> {
        tracing::info!(
            worker_id = %self.id,
            job_id = %job.job_id,
            mode = ?job.mode,
            url = %job.url,
            "Processing job"
        );

        // Heartbeat runs as its own task, joined via cancellation, so slow
        // engine calls never block lease renewal.
        let heartbeat_token = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.services.clone(),
            job.tenant_id.clone(),
            job.job_id.clone(),
            heartbeat_token.clone(),
        ));

        let outcome = self.dispatch(&job).await;

        heartbeat_token.cancel();
        let _ = heartbeat.await;

        let result = self.finish(&job, outcome).await;

        self.services.scheduler.release(&job.job_id).await?;
        self.services
            .admission
            .complete(&job.tenant_id, job.plan, &job.job_id)
            .await?;

        result
    }

    async fn dispatch(&self, job: &ScrapeJob) -> Result<Option<TransformedPage>, ScrapeError> {
        if let Some(crawl_id) = &job.crawl_id {
            if self.services.registry.is_cancelled(crawl_id).await? {
                return Err(ScrapeError::Cancelled);
            }
        }

        match job.mode {
            JobMode::Kickoff => {
                self.process_kickoff(job).await?;
                Ok(None)
            }
            JobMode::Single | JobMode::CrawlChild => {
                let page = self
                    .services
                    .pipeline
                    .run(&job.url, &job.scrape_options, &job.internal_options)
                    .await?;
                Ok(Some(page))
            }
        }
    }

    /// Seed a crawl: origin URL plus sitemap discoveries for crawls, the
    /// explicit seed list for batch scrapes.
    async fn process_kickoff(&self, job: &ScrapeJob) -> Result<(), ScrapeError> {
        let services = &self.services;
        let crawl_id = job.crawl_id.as_deref().ok_or_else(|| ScrapeError::Engine {
            engine: "kickoff".to_string(),
            message: "kickoff job without crawl id".to_string(),
        })?;
        let mut crawl =
            services
                .registry
                .get_crawl(crawl_id)
                .await?
                .ok_or_else(|| ScrapeError::Engine {
                    engine: "kickoff".to_string(),
                    message: format!("crawl record {crawl_id} missing"),
                })?;

        if let Some(webhook) = &crawl.webhook {
            if crawl.kind == CrawlKind::Crawl {
                services
                    .webhooks
                    .deliver(webhook, WebhookEvent::CrawlStarted, crawl_id, true, &[], None)
                    .await;
            }
        }

        match crawl.kind {
            CrawlKind::BatchScrape => {
                let seeds = crawl.seed_urls.clone();
                for seed in seeds {
                    if services.registry.is_cancelled(crawl_id).await? {
                        return Err(ScrapeError::Cancelled);
                    }
                    if services.registry.enrolled_count(crawl_id).await?
                        >= crawl.crawler_options.limit as u64
                    {
                        break;
                    }
                    if services
                        .registry
                        .lock_url(crawl_id, &seed, &crawl.crawler_options)
                        .await?
                    {
                        self.enqueue_child(&crawl, seed, BASE_SINGLE_SCRAPE, 0).await?;
                    }
                }
            }
            CrawlKind::Crawl => {
                // Fetched regardless of ignore_robots_txt: the sitemap
                // declarations are useful either way.
                let robots = services.robots.fetch(&crawl.origin_url).await;
                if robots.loaded {
                    crawl.robots_txt = Some(robots.raw.clone());
                    services.registry.save_crawl(&crawl).await?;
                }

                if services
                    .registry
                    .lock_url(crawl_id, &crawl.origin_url, &crawl.crawler_options)
                    .await?
                {
                    self.enqueue_child(&crawl, crawl.origin_url.clone(), BASE_KICKOFF, 0)
                        .await?;
                }

                if !crawl.crawler_options.ignore_sitemap {
                    let entries = services
                        .sitemaps
                        .discover(&crawl.origin_url, &robots.sitemaps)
                        .await;
                    tracing::info!(
                        crawl_id = %crawl_id,
                        sitemap_urls = entries.len(),
                        "Sitemap discovery complete"
                    );

                    let filter = LinkFilter::new(
                        &crawl.origin_url,
                        &crawl.crawler_options,
                        Some(robots),
                        &services.config.user_agent,
                    );
                    if let Some(filter) = filter {
                        for entry in entries {
                            if services.registry.is_cancelled(crawl_id).await? {
                                return Err(ScrapeError::Cancelled);
                            }
                            if services.registry.enrolled_count(crawl_id).await?
                                >= crawl.crawler_options.limit as u64
                            {
                                break;
                            }
                            let Some(canonical) = filter.filter(&entry.url) else {
                                continue;
                            };
                            if services
                                .registry
                                .lock_url(crawl_id, &canonical, &crawl.crawler_options)
                                .await?
                            {
                                self.enqueue_child(
                                    &crawl,
                                    canonical,
                                    BASE_SITEMAP_DISCOVERED,
                                    0,
                                )
                                .await?;
                            }
                        }
                    }
                }
            }
        }

        services.registry.finish_kickoff(crawl_id).await?;
        Ok(())
    }

    /// Build, enroll, and admit one crawl child job.
    async fn enqueue_child(
        &self,
        crawl: &Crawl,
        url: String,
        base_priority: i32,
        depth: u32,
    ) -> Result<(), StoreError> {
        let job = ScrapeJob {
            job_id: Uuid::new_v4().to_string(),
            url,
            mode: JobMode::CrawlChild,
            tenant_id: crawl.tenant_id.clone(),
            plan: crawl.plan,
            crawl_id: Some(crawl.crawl_id.clone()),
            scrape_options: crawl.scrape_options.clone(),
            internal_options: InternalOptions {
                base_priority,
                ..crawl.internal_options.clone()
            },
            origin: "crawl".to_string(),
            webhook: crawl.webhook.clone(),
            depth,
        };
        let priority = self
            .services
            .scorer
            .score_for_enqueue(&job.tenant_id, job.plan, &job.job_id, base_priority)
            .await?;
        // Enroll before admitting so the done counter can never outrun the
        // enrolled counter.
        self.services
            .registry
            .add_crawl_job(&crawl.crawl_id, &job.job_id)
            .await?;
        self.services.admission.admit(&job, priority).await?;
        Ok(())
    }

    /// Report the outcome of a dispatched job to the scheduler, the crawl
    /// registry, and webhooks.
    async fn finish(
        &self,
        job: &ScrapeJob,
        outcome: Result<Option<TransformedPage>, ScrapeError>,
    ) -> Result<(), StoreError> {
        let services = &self.services;
        match outcome {
            Ok(Some(page)) => self.finish_scrape(job, page).await,
            Ok(None) => {
                // Kickoff: children report themselves; the crawl may already
                // be complete if nothing was enrolled.
                services.scheduler.set_state(&job.job_id, JobState::Succeeded).await?;
                if let Some(crawl_id) = &job.crawl_id {
                    self.finalize_if_done(crawl_id).await?;
                }
                Ok(())
            }
            Err(ScrapeError::Store(e)) => Err(e),
            Err(ScrapeError::Cancelled) => {
                tracing::info!(job_id = %job.job_id, "Job cancelled");
                self.silent_drop(job).await
            }
            Err(ScrapeError::RacedRedirect) => {
                // Another job owns the redirect target and will produce the
                // document; this one vanishes quietly.
                tracing::debug!(job_id = %job.job_id, "Redirect target already owned, dropping");
                self.silent_drop(job).await
            }
            Err(error) => {
                tracing::warn!(job_id = %job.job_id, error = %error, "Job failed");
                services.scheduler.set_state(&job.job_id, JobState::Failed).await?;
                services.scheduler.record_error(&job.job_id, &error.to_string()).await?;
                if let Some(crawl_id) = &job.crawl_id {
                    if job.mode == JobMode::Kickoff {
                        // A dead kickoff must still let the crawl terminate:
                        // whatever it managed to enroll decides the outcome.
                        services.registry.finish_kickoff(crawl_id).await?;
                    } else {
                        services.registry.add_done(crawl_id, &job.job_id, false).await?;
                        if let Some(crawl) = services.registry.get_crawl(crawl_id).await? {
                            if let Some(webhook) = &crawl.webhook {
                                let event = match crawl.kind {
                                    CrawlKind::Crawl => WebhookEvent::CrawlPage,
                                    CrawlKind::BatchScrape => WebhookEvent::BatchScrapePage,
                                };
                                services
                                    .webhooks
                                    .deliver(
                                        webhook,
                                        event,
                                        crawl_id,
                                        false,
                                        &[],
                                        Some(&error.to_string()),
                                    )
                                    .await;
                            }
                        }
                    }
                    self.finalize_if_done(crawl_id).await?;
                }
                Ok(())
            }
        }
    }

    /// Terminal path for cancelled and raced jobs: counts toward done, never
    /// surfaces an error to the caller. Kickoff jobs are not enrolled, so
    /// they never touch the done counter.
    async fn silent_drop(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        self.services
            .scheduler
            .set_state(&job.job_id, JobState::Cancelled)
            .await?;
        if let Some(crawl_id) = &job.crawl_id {
            if job.mode != JobMode::Kickoff {
                self.services
                    .registry
                    .add_done(crawl_id, &job.job_id, false)
                    .await?;
            }
            self.finalize_if_done(crawl_id).await?;
        }
        Ok(())
    }

    async fn finish_scrape(&self, job: &ScrapeJob, page: TransformedPage) -> Result<(), StoreError> {
        let services = &self.services;
        let Some(crawl_id) = job.crawl_id.clone() else {
            // Plain single scrape: persist and stop.
            if !job.internal_options.zero_data_retention {
                services.scheduler.store_result(&job.job_id, &page.document).await?;
            }
            services.scheduler.set_state(&job.job_id, JobState::Succeeded).await?;
            return Ok(());
        };

        let Some(crawl) = services.registry.get_crawl(&crawl_id).await? else {
            services.scheduler.set_state(&job.job_id, JobState::Failed).await?;
            return Ok(());
        };

        // A cancel that landed while the pipeline ran: drop the result and
        // enqueue nothing.
        if crawl.cancelled {
            tracing::info!(job_id = %job.job_id, "Crawl cancelled mid-scrape, dropping result");
            return self.silent_drop(job).await;
        }

        // Redirect reconciliation: if the served URL is a different page than
        // the requested one, it must be lockable or another job owns it.
        if let Some(source) = normalize_url(&job.url, &crawl.crawler_options) {
            if let Some(served) =
                normalize_url(&page.document.metadata.url, &crawl.crawler_options)
            {
                if source != served
                    && !services
                        .registry
                        .lock_url(&crawl_id, &served, &crawl.crawler_options)
                        .await?
                {
                    tracing::debug!(job_id = %job.job_id, "Redirect target already owned, dropping");
                    return self.silent_drop(job).await;
                }
            }
        }

        if !job.internal_options.zero_data_retention {
            services.scheduler.store_result(&job.job_id, &page.document).await?;
        }
        services.scheduler.set_state(&job.job_id, JobState::Succeeded).await?;
        services.registry.add_done(&crawl_id, &job.job_id, true).await?;

        if let Some(webhook) = &crawl.webhook {
            let event = match crawl.kind {
                CrawlKind::Crawl => WebhookEvent::CrawlPage,
                CrawlKind::BatchScrape => WebhookEvent::BatchScrapePage,
            };
            services
                .webhooks
                .deliver(
                    webhook,
                    event,
                    &crawl_id,
                    true,
                    std::slice::from_ref(&page.document),
                    None,
                )
                .await;
        }

        // Link discovery only applies to real crawls within their depth
        // budget.
        if crawl.kind == CrawlKind::Crawl && job.depth < crawl.crawler_options.max_depth {
            self.enqueue_discovered(&crawl, job, &page.discovered_links)
                .await?;
        }

        self.finalize_if_done(&crawl_id).await?;
        Ok(())
    }

    async fn enqueue_discovered(
        &self,
        crawl: &Crawl,
        parent: &ScrapeJob,
        links: &[String],
    ) -> Result<(), StoreError> {
        let services = &self.services;
        let robots = crawl
            .robots_txt
            .as_deref()
            .map(RobotsChecker::from_content);
        let Some(filter) = LinkFilter::new(
            &crawl.origin_url,
            &crawl.crawler_options,
            robots,
            &services.config.user_agent,
        ) else {
            return Ok(());
        };

        for link in links {
            if services.registry.is_cancelled(&crawl.crawl_id).await? {
                tracing::info!(crawl_id = %crawl.crawl_id, "Crawl cancelled, stopping discovery");
                return Ok(());
            }
            if services.registry.enrolled_count(&crawl.crawl_id).await?
                >= crawl.crawler_options.limit as u64
            {
                return Ok(());
            }
            let Some(canonical) = filter.filter(link) else {
                continue;
            };
            if services
                .registry
                .lock_url(&crawl.crawl_id, &canonical, &crawl.crawler_options)
                .await?
            {
                self.enqueue_child(crawl, canonical, BASE_LINK_DISCOVERED, parent.depth + 1)
                    .await?;
            }
        }
        Ok(())
    }

    /// Fire the terminal webhook if this call wins finalization.
    async fn finalize_if_done(&self, crawl_id: &str) -> Result<(), StoreError> {
        let services = &self.services;
        if !services.registry.try_finalize(crawl_id).await? {
            return Ok(());
        }
        let Some(crawl) = services.registry.get_crawl(crawl_id).await? else {
            return Ok(());
        };
        let succeeded = services.registry.success_count(crawl_id).await?;
        let done = services.registry.done_count(crawl_id).await?;
        let all_failed = done > 0 && succeeded == 0;
        if let Some(webhook) = &crawl.webhook {
            let event = match crawl.kind {
                CrawlKind::Crawl => WebhookEvent::CrawlCompleted,
                CrawlKind::BatchScrape => WebhookEvent::BatchScrapeCompleted,
            };
            services
                .webhooks
                .deliver(
                    webhook,
                    event,
                    crawl_id,
                    !all_failed,
                    &[],
                    all_failed.then_some("every page failed"),
                )
                .await;
        }
        Ok(())
    }
}

/// Renew the admission lease and broker lease until cancelled.
async fn heartbeat_loop(
    services: Arc<WorkerServices>,
    tenant_id: String,
    job_id: String,
    token: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(services.config.renew_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = services.admission.renew(&tenant_id, &job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Lease renewal failed");
                }
                if let Err(e) = services
                    .scheduler
                    .extend_lease(&job_id, services.config.lease_extension_secs)
                    .await
                {
                    tracing::warn!(job_id = %job_id, error = %e, "Broker lease extension failed");
                }
            }
        }
    }
}
