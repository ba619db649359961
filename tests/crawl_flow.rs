//! End-to-end flows over a fake engine set and the in-memory state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::Json, routing::post, Router};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scrapeloop::config::Config;
use scrapeloop::crawl::robots::{RobotsChecker, RobotsProvider};
use scrapeloop::crawl::sitemap::{SitemapEntry, SitemapProvider};
use scrapeloop::crawl::CrawlRegistry;
use scrapeloop::engine::{
    EngineDescriptor, EngineRegistry, EngineRequest, EngineResponse, Feature, ScrapeEngine,
};
use scrapeloop::error::ScrapeError;
use scrapeloop::models::{
    Crawl, CrawlKind, CrawlerOptions, InternalOptions, JobMode, JobState, Plan, PlanPolicy,
    ScrapeJob, ScrapeOptions, Webhook,
};
use scrapeloop::pipeline::ScrapePipeline;
use scrapeloop::queue::admission::ConcurrencyManager;
use scrapeloop::queue::priority::{PriorityScorer, BASE_KICKOFF, BASE_SINGLE_SCRAPE};
use scrapeloop::queue::JobScheduler;
use scrapeloop::store::{MemoryStore, StateStore};
use scrapeloop::webhook::WebhookNotifier;
use scrapeloop::worker::{Worker, WorkerServices};

// --- Fakes ---

enum FakeBehavior {
    /// Serve HTML per URL, with a default body for unknown URLs.
    Serve {
        pages: HashMap<String, String>,
        default_html: String,
    },
    /// Report that the content needs the PDF pipeline.
    PromotePdf,
}

struct FakeEngine {
    descriptor: EngineDescriptor,
    behavior: FakeBehavior,
}

#[async_trait]
impl ScrapeEngine for FakeEngine {
    fn descriptor(&self) -> EngineDescriptor {
        self.descriptor.clone()
    }

    async fn scrape(&self, request: &EngineRequest) -> Result<EngineResponse, ScrapeError> {
        match &self.behavior {
            FakeBehavior::Serve {
                pages,
                default_html,
            } => {
                let html = pages
                    .get(&request.url)
                    .cloned()
                    .unwrap_or_else(|| default_html.clone());
                Ok(EngineResponse {
                    url: request.url.clone(),
                    status_code: 200,
                    html: Some(html),
                    content_type: Some("text/html".to_string()),
                    screenshot: None,
                    error: None,
                })
            }
            FakeBehavior::PromotePdf => Err(ScrapeError::AddFeatures {
                flags: Feature::PDF,
                pdf_prefetch: None,
            }),
        }
    }
}

fn serving_engine(pages: &[(&str, &str)]) -> Arc<dyn ScrapeEngine> {
    Arc::new(FakeEngine {
        descriptor: EngineDescriptor {
            name: "http",
            capabilities: Feature::SKIP_TLS | Feature::FAST_MODE,
            quality: 5,
        },
        behavior: FakeBehavior::Serve {
            pages: pages
                .iter()
                .map(|(url, html)| (url.to_string(), html.to_string()))
                .collect(),
            default_html: "<html><body>page</body></html>".to_string(),
        },
    })
}

struct FakeRobots(String);

#[async_trait]
impl RobotsProvider for FakeRobots {
    async fn fetch(&self, _origin_url: &str) -> RobotsChecker {
        RobotsChecker::from_content(&self.0)
    }
}

struct FakeSitemap(Vec<SitemapEntry>);

#[async_trait]
impl SitemapProvider for FakeSitemap {
    async fn discover(&self, _origin_url: &str, _robots_sitemaps: &[String]) -> Vec<SitemapEntry> {
        self.0.clone()
    }
}

// --- Harness ---

struct Harness {
    store: Arc<dyn StateStore>,
    scheduler: JobScheduler,
    admission: Arc<ConcurrencyManager>,
    scorer: PriorityScorer,
    registry: CrawlRegistry,
    services: Arc<WorkerServices>,
}

fn test_config() -> Config {
    Config {
        shared_secret: "test_secret".to_string(),
        redis_url: "redis://unused".to_string(),
        port: 0,
        user_agent: "scrapeloop-test/1.0".to_string(),
        worker_count: 1,
        fetch_rate_per_second: 100,
        browser_script_path: None,
        converter_url: None,
        max_browser_sessions: 1,
        max_cpu_utilization: 1.0,
        max_memory_utilization: 1.0,
        poll_interval_ms: 10,
        resource_backoff_ms: 10,
        renew_interval_secs: 15,
        lease_extension_secs: 60,
        webhook_timeout_secs: 5,
        enterprise_concurrency: 200,
    }
}

fn harness(
    engines: Vec<Arc<dyn ScrapeEngine>>,
    sitemap: Vec<SitemapEntry>,
    robots: &str,
) -> Harness {
    let config = Arc::new(test_config());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let scheduler = JobScheduler::new(store.clone());
    let admission = Arc::new(ConcurrencyManager::new(
        store.clone(),
        scheduler.clone(),
        PlanPolicy {
            enterprise_concurrency: config.enterprise_concurrency,
        },
    ));
    let scorer = PriorityScorer::new(store.clone());
    let registry = CrawlRegistry::new(store.clone());
    let pipeline = ScrapePipeline::new(Arc::new(EngineRegistry::new(engines)));
    let webhooks = WebhookNotifier::new(config.shared_secret.clone(), config.webhook_timeout_secs);

    let services = Arc::new(WorkerServices {
        store: store.clone(),
        scheduler: scheduler.clone(),
        admission: admission.clone(),
        scorer: scorer.clone(),
        registry: registry.clone(),
        pipeline,
        webhooks,
        robots: Arc::new(FakeRobots(robots.to_string())),
        sitemaps: Arc::new(FakeSitemap(sitemap)),
        config,
    });

    Harness {
        store,
        scheduler,
        admission,
        scorer,
        registry,
        services,
    }
}

impl Harness {
    fn spawn_worker(&self) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let token = CancellationToken::new();
        let worker = Worker::new("worker-test".to_string(), self.services.clone());
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            worker.run(run_token).await.expect("worker loop failed");
        });
        (token, handle)
    }

    async fn submit_scrape(&self, job: &ScrapeJob) {
        let priority = self
            .scorer
            .score_for_enqueue(
                &job.tenant_id,
                job.plan,
                &job.job_id,
                job.internal_options.base_priority,
            )
            .await
            .unwrap();
        self.admission.admit(job, priority).await.unwrap();
    }

    async fn submit_crawl(&self, crawl: &Crawl) {
        self.registry.save_crawl(crawl).await.unwrap();
        let kickoff = ScrapeJob {
            job_id: Uuid::new_v4().to_string(),
            url: crawl.origin_url.clone(),
            mode: JobMode::Kickoff,
            tenant_id: crawl.tenant_id.clone(),
            plan: crawl.plan,
            crawl_id: Some(crawl.crawl_id.clone()),
            scrape_options: crawl.scrape_options.clone(),
            internal_options: InternalOptions {
                base_priority: BASE_KICKOFF,
                ..crawl.internal_options.clone()
            },
            origin: "api".to_string(),
            webhook: crawl.webhook.clone(),
            depth: 0,
        };
        let priority = self
            .scorer
            .score_for_enqueue(&kickoff.tenant_id, kickoff.plan, &kickoff.job_id, BASE_KICKOFF)
            .await
            .unwrap();
        self.admission.admit(&kickoff, priority).await.unwrap();
    }
}

fn single_job(url: &str) -> ScrapeJob {
    ScrapeJob {
        job_id: Uuid::new_v4().to_string(),
        url: url.to_string(),
        mode: JobMode::Single,
        tenant_id: "team-1".to_string(),
        plan: Plan::Free,
        crawl_id: None,
        scrape_options: ScrapeOptions::default(),
        internal_options: InternalOptions {
            base_priority: BASE_SINGLE_SCRAPE,
            ..InternalOptions::default()
        },
        origin: "api".to_string(),
        webhook: None,
        depth: 0,
    }
}

fn crawl_of(origin: &str, options: CrawlerOptions, webhook: Option<Webhook>) -> Crawl {
    Crawl {
        crawl_id: Uuid::new_v4().to_string(),
        origin_url: origin.to_string(),
        tenant_id: "team-1".to_string(),
        plan: Plan::Standard,
        kind: CrawlKind::Crawl,
        seed_urls: Vec::new(),
        crawler_options: options,
        scrape_options: ScrapeOptions::default(),
        internal_options: InternalOptions::default(),
        robots_txt: None,
        created_at: 0,
        cancelled: false,
        webhook,
    }
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Local HTTP sink that records webhook deliveries.
async fn spawn_webhook_sink() -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
    let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let app = Router::new().route(
        "/hook",
        post(move |Json(body): Json<serde_json::Value>| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(body);
                "ok"
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), received)
}

// --- Scenarios ---

#[tokio::test]
async fn test_single_scrape_returns_document() {
    let harness = harness(
        vec![serving_engine(&[(
            "https://example.com/",
            "<html><body>Hi</body></html>",
        )])],
        Vec::new(),
        "",
    );

    let job = single_job("https://example.com/");
    harness.submit_scrape(&job).await;
    assert_eq!(harness.admission.active_count("team-1").await.unwrap(), 1);

    let (token, handle) = harness.spawn_worker();
    let scheduler = harness.scheduler.clone();
    let job_id = job.job_id.clone();
    wait_until("single scrape to finish", || {
        let scheduler = scheduler.clone();
        let job_id = job_id.clone();
        async move { scheduler.state(&job_id).await.unwrap() == Some(JobState::Succeeded) }
    })
    .await;
    token.cancel();
    handle.await.unwrap();

    let document = harness.scheduler.result(&job.job_id).await.unwrap().unwrap();
    assert_eq!(document.markdown.as_deref().map(str::trim), Some("Hi"));
    assert_eq!(document.metadata.status_code, 200);
    assert_eq!(document.metadata.url, "https://example.com/");

    // Slot released, nothing pending, no crawl state touched.
    assert_eq!(harness.admission.active_count("team-1").await.unwrap(), 0);
    assert_eq!(harness.admission.pending_count("team-1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_crawl_with_sitemap_include_and_limit() {
    let (hook_url, received) = spawn_webhook_sink().await;

    let sitemap = vec![
        SitemapEntry {
            url: "https://site.test/".to_string(),
            priority: Some(1.0),
        },
        SitemapEntry {
            url: "https://site.test/docs/a".to_string(),
            priority: None,
        },
        SitemapEntry {
            url: "https://site.test/docs/b".to_string(),
            priority: None,
        },
        SitemapEntry {
            url: "https://site.test/about".to_string(),
            priority: None,
        },
    ];
    let harness = harness(vec![serving_engine(&[])], sitemap, "");

    let crawl = crawl_of(
        "https://site.test/",
        CrawlerOptions {
            includes: vec!["^/docs/".to_string()],
            limit: 3,
            ..CrawlerOptions::default()
        },
        Some(Webhook {
            url: hook_url,
            headers: HashMap::new(),
            metadata: None,
            events: Vec::new(),
        }),
    );
    harness.submit_crawl(&crawl).await;

    let (token, handle) = harness.spawn_worker();
    let registry = harness.registry.clone();
    let crawl_id = crawl.crawl_id.clone();
    wait_until("crawl to finalize", || {
        let registry = registry.clone();
        let crawl_id = crawl_id.clone();
        async move { registry.is_finished(&crawl_id).await.unwrap() }
    })
    .await;
    token.cancel();
    handle.await.unwrap();

    // Origin plus the two /docs/ pages; /about filtered out.
    assert_eq!(harness.registry.enrolled_count(&crawl.crawl_id).await.unwrap(), 3);
    assert_eq!(harness.registry.done_count(&crawl.crawl_id).await.unwrap(), 3);

    // Exactly one completion event, after one started and three page events.
    wait_until("webhooks to drain", || {
        let received = received.clone();
        async move {
            received
                .lock()
                .await
                .iter()
                .filter(|event| event["type"] == "crawl.completed")
                .count()
                == 1
        }
    })
    .await;
    let events = received.lock().await;
    let count_of = |kind: &str| events.iter().filter(|e| e["type"] == kind).count();
    assert_eq!(count_of("crawl.started"), 1);
    assert_eq!(count_of("crawl.page"), 3);
    assert_eq!(count_of("crawl.completed"), 1);
    assert!(events
        .iter()
        .all(|event| event["id"] == crawl.crawl_id.as_str()));
}

#[tokio::test]
async fn test_concurrent_lock_has_single_winner() {
    let harness = harness(vec![serving_engine(&[])], Vec::new(), "");
    let options = CrawlerOptions {
        ignore_query_parameters: true,
        ..CrawlerOptions::default()
    };

    let first = harness
        .registry
        .lock_url("c-1", "https://site.test/x?y=1", &options);
    let second = harness
        .registry
        .lock_url("c-1", "https://site.test/x?y=2", &options);
    let (first, second) = tokio::join!(first, second);

    // Query stripped, so both race for the same page and one wins.
    assert!(first.unwrap() ^ second.unwrap());
}

#[tokio::test]
async fn test_pdf_promotion_falls_through_to_document_engine() {
    let sniffing_engine: Arc<dyn ScrapeEngine> = Arc::new(FakeEngine {
        descriptor: EngineDescriptor {
            name: "http",
            capabilities: Feature::SKIP_TLS | Feature::FAST_MODE,
            quality: 5,
        },
        behavior: FakeBehavior::PromotePdf,
    });
    let pdf_engine: Arc<dyn ScrapeEngine> = Arc::new(FakeEngine {
        descriptor: EngineDescriptor {
            name: "document",
            capabilities: Feature::PDF | Feature::DOCX,
            quality: 5,
        },
        behavior: FakeBehavior::Serve {
            pages: HashMap::new(),
            default_html: "<html><body>Paper</body></html>".to_string(),
        },
    });

    let harness = harness(vec![sniffing_engine, pdf_engine], Vec::new(), "");
    let job = single_job("https://site.test/whitepaper.pdf");
    harness.submit_scrape(&job).await;

    let (token, handle) = harness.spawn_worker();
    let scheduler = harness.scheduler.clone();
    let job_id = job.job_id.clone();
    wait_until("pdf scrape to finish", || {
        let scheduler = scheduler.clone();
        let job_id = job_id.clone();
        async move { scheduler.state(&job_id).await.unwrap() == Some(JobState::Succeeded) }
    })
    .await;
    token.cancel();
    handle.await.unwrap();

    let document = harness.scheduler.result(&job.job_id).await.unwrap().unwrap();
    assert_eq!(document.markdown.as_deref().map(str::trim), Some("Paper"));
}

#[tokio::test]
async fn test_free_plan_concurrency_and_fifo_drain() {
    let harness = harness(vec![serving_engine(&[])], Vec::new(), "");

    let jobs: Vec<ScrapeJob> = (0..5)
        .map(|i| single_job(&format!("https://example.com/page-{i}")))
        .collect();
    for job in &jobs {
        harness.submit_scrape(job).await;
    }

    // Free plan ceiling is 2: two run now, three queue.
    assert_eq!(harness.admission.active_count("team-1").await.unwrap(), 2);
    assert_eq!(harness.admission.pending_count("team-1").await.unwrap(), 3);

    let (token, handle) = harness.spawn_worker();
    let scheduler = harness.scheduler.clone();
    let ids: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
    wait_until("all five scrapes to finish", || {
        let scheduler = scheduler.clone();
        let ids = ids.clone();
        async move {
            for id in &ids {
                if scheduler.state(id).await.unwrap() != Some(JobState::Succeeded) {
                    return false;
                }
            }
            true
        }
    })
    .await;
    token.cancel();
    handle.await.unwrap();

    assert_eq!(harness.admission.active_count("team-1").await.unwrap(), 0);
    assert_eq!(harness.admission.pending_count("team-1").await.unwrap(), 0);
    for job in &jobs {
        assert!(harness.scheduler.result(&job.job_id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_stalled_job_redelivers_then_completes() {
    let harness = harness(
        vec![serving_engine(&[(
            "https://example.com/",
            "<html><body>Hi</body></html>",
        )])],
        Vec::new(),
        "",
    );

    let job = single_job("https://example.com/");
    harness.submit_scrape(&job).await;

    // A worker claims the job with an already-expired lease and dies.
    let claimed = harness.scheduler.claim(0).await.unwrap().unwrap();
    assert_eq!(claimed.job_id, job.job_id);
    assert!(harness.scheduler.claim(60).await.unwrap().is_none());

    // The reaper re-delivers it; a healthy worker finishes it.
    harness.scheduler.reap_stalled().await.unwrap();
    assert_eq!(
        harness.scheduler.state(&job.job_id).await.unwrap(),
        Some(JobState::Pending)
    );

    let (token, handle) = harness.spawn_worker();
    let scheduler = harness.scheduler.clone();
    let job_id = job.job_id.clone();
    wait_until("redelivered job to finish", || {
        let scheduler = scheduler.clone();
        let job_id = job_id.clone();
        async move { scheduler.state(&job_id).await.unwrap() == Some(JobState::Succeeded) }
    })
    .await;
    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancelled_crawl_never_scrapes() {
    let (hook_url, received) = spawn_webhook_sink().await;
    let harness = harness(
        vec![serving_engine(&[])],
        vec![SitemapEntry {
            url: "https://site.test/a".to_string(),
            priority: None,
        }],
        "",
    );

    let crawl = crawl_of(
        "https://site.test/",
        CrawlerOptions::default(),
        Some(Webhook {
            url: hook_url,
            headers: HashMap::new(),
            metadata: None,
            events: Vec::new(),
        }),
    );
    harness.submit_crawl(&crawl).await;
    harness.registry.cancel(&crawl.crawl_id).await.unwrap();

    let (token, handle) = harness.spawn_worker();
    let store = harness.store.clone();
    wait_until("kickoff to be dropped", || {
        let store = store.clone();
        async move {
            // Ready queue drained and nothing processing.
            store.llen("queue:ready").await.unwrap() == 0
                && store.zcard("queue:processing").await.unwrap() == 0
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();
    handle.await.unwrap();

    assert_eq!(harness.registry.enrolled_count(&crawl.crawl_id).await.unwrap(), 0);
    assert_eq!(
        harness.registry.status(&crawl.crawl_id).await.unwrap(),
        scrapeloop::models::CrawlStatusKind::Cancelled
    );
    assert!(received.lock().await.is_empty());
}

#[tokio::test]
async fn test_batch_scrape_processes_explicit_urls() {
    let (hook_url, received) = spawn_webhook_sink().await;
    let harness = harness(vec![serving_engine(&[])], Vec::new(), "");

    let mut crawl = crawl_of(
        "https://site.test/a",
        CrawlerOptions {
            deduplicate_similar_urls: false,
            ..CrawlerOptions::default()
        },
        Some(Webhook {
            url: hook_url,
            headers: HashMap::new(),
            metadata: None,
            events: Vec::new(),
        }),
    );
    crawl.kind = CrawlKind::BatchScrape;
    crawl.seed_urls = vec![
        "https://site.test/a".to_string(),
        "https://site.test/b".to_string(),
    ];
    harness.submit_crawl(&crawl).await;

    let (token, handle) = harness.spawn_worker();
    let registry = harness.registry.clone();
    let crawl_id = crawl.crawl_id.clone();
    wait_until("batch to finalize", || {
        let registry = registry.clone();
        let crawl_id = crawl_id.clone();
        async move { registry.is_finished(&crawl_id).await.unwrap() }
    })
    .await;
    token.cancel();
    handle.await.unwrap();

    assert_eq!(harness.registry.enrolled_count(&crawl.crawl_id).await.unwrap(), 2);
    assert_eq!(harness.registry.done_count(&crawl.crawl_id).await.unwrap(), 2);

    wait_until("batch completion webhook", || {
        let received = received.clone();
        async move {
            received
                .lock()
                .await
                .iter()
                .any(|event| event["type"] == "batch_scrape.completed")
        }
    })
    .await;
    let events = received.lock().await;
    assert_eq!(
        events
            .iter()
            .filter(|e| e["type"] == "batch_scrape.page")
            .count(),
        2
    );
}

#[tokio::test]
async fn test_crawl_discovers_links_from_pages() {
    let harness = harness(
        vec![serving_engine(&[
            (
                "https://site.test/",
                r#"<html><body><a href="/docs/a">a</a><a href="/docs/b">b</a></body></html>"#,
            ),
            ("https://site.test/docs/a", "<html><body>leaf</body></html>"),
            ("https://site.test/docs/b", "<html><body>leaf</body></html>"),
        ])],
        Vec::new(),
        "",
    );

    let crawl = crawl_of(
        "https://site.test/",
        CrawlerOptions {
            ignore_sitemap: true,
            ..CrawlerOptions::default()
        },
        None,
    );
    harness.submit_crawl(&crawl).await;

    let (token, handle) = harness.spawn_worker();
    let registry = harness.registry.clone();
    let crawl_id = crawl.crawl_id.clone();
    wait_until("link-discovery crawl to finalize", || {
        let registry = registry.clone();
        let crawl_id = crawl_id.clone();
        async move { registry.is_finished(&crawl_id).await.unwrap() }
    })
    .await;
    token.cancel();
    handle.await.unwrap();

    // Origin plus the two discovered pages, each scraped exactly once.
    assert_eq!(harness.registry.enrolled_count(&crawl.crawl_id).await.unwrap(), 3);
    assert_eq!(harness.registry.done_count(&crawl.crawl_id).await.unwrap(), 3);
}
