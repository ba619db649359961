use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use scrapeloop::config::Config;
use scrapeloop::crawl::robots::HttpRobotsProvider;
use scrapeloop::crawl::sitemap::HttpSitemapProvider;
use scrapeloop::crawl::CrawlRegistry;
use scrapeloop::engine::browser::BrowserEngine;
use scrapeloop::engine::document::DocumentEngine;
use scrapeloop::engine::http::HttpEngine;
use scrapeloop::engine::{EngineRegistry, ScrapeEngine};
use scrapeloop::models::PlanPolicy;
use scrapeloop::pipeline::ScrapePipeline;
use scrapeloop::queue::admission::ConcurrencyManager;
use scrapeloop::queue::priority::PriorityScorer;
use scrapeloop::queue::JobScheduler;
use scrapeloop::store::{RedisStore, StateStore};
use scrapeloop::webhook::WebhookNotifier;
use scrapeloop::worker::{Worker, WorkerServices};
use scrapeloop::{build_app, AppState};

#[tokio::main]
async fn main() {
    // Initialize tracing with RUST_LOG env filter (defaults to "info")
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration from environment variables
    let config =
        Arc::new(Config::from_env().expect("Failed to load configuration from environment"));
    let port = config.port;

    let store: Arc<dyn StateStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .expect("Failed to connect to the state store"),
    );

    // Engine registry: fixed at startup from what is actually configured.
    let mut engines: Vec<Arc<dyn ScrapeEngine>> = vec![Arc::new(HttpEngine::new(
        config.fetch_rate_per_second,
        &config.user_agent,
    ))];
    if let Some(script_path) = &config.browser_script_path {
        engines.push(Arc::new(BrowserEngine::new(
            script_path.clone(),
            config.max_browser_sessions,
        )));
    }
    if let Some(converter_url) = &config.converter_url {
        engines.push(Arc::new(DocumentEngine::new(
            converter_url.clone(),
            &config.user_agent,
        )));
    }
    tracing::info!(engines = engines.len(), "Engine registry initialized");
    let engine_registry = Arc::new(EngineRegistry::new(engines));

    let scheduler = JobScheduler::new(store.clone());
    let policy = PlanPolicy {
        enterprise_concurrency: config.enterprise_concurrency,
    };
    let admission = Arc::new(ConcurrencyManager::new(
        store.clone(),
        scheduler.clone(),
        policy,
    ));
    let scorer = PriorityScorer::new(store.clone());
    let crawl_registry = CrawlRegistry::new(store.clone());
    let pipeline = ScrapePipeline::new(engine_registry);
    let webhooks = WebhookNotifier::new(config.shared_secret.clone(), config.webhook_timeout_secs);

    let discovery_client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build discovery client");

    let services = Arc::new(WorkerServices {
        store: store.clone(),
        scheduler: scheduler.clone(),
        admission: admission.clone(),
        scorer: scorer.clone(),
        registry: crawl_registry.clone(),
        pipeline,
        webhooks,
        robots: Arc::new(HttpRobotsProvider::new(discovery_client.clone())),
        sitemaps: Arc::new(HttpSitemapProvider::new(discovery_client)),
        config: config.clone(),
    });

    let shutdown = CancellationToken::new();
    let mut workers = JoinSet::new();
    for index in 0..config.worker_count {
        let worker = Worker::new(format!("worker-{index}"), services.clone());
        workers.spawn(worker.run(shutdown.clone()));
    }

    let state = AppState {
        config: config.clone(),
        scheduler,
        admission,
        scorer,
        registry: crawl_registry,
    };
    let app = build_app(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Scrape service starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()));

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Server error");
            }
        }
        Some(result) = workers.join_next() => {
            match result {
                Ok(Err(e)) => {
                    // Unrecoverable store loss: exit non-zero so the
                    // supervisor restarts the process.
                    tracing::error!(error = %e, "Worker lost the state store, exiting");
                    std::process::exit(1);
                }
                Ok(Ok(())) => tracing::warn!("Worker exited unexpectedly"),
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }
    }

    // Drain: stop claiming, let in-flight jobs finish.
    shutdown.cancel();
    while let Some(result) = workers.join_next().await {
        if let Ok(Err(e)) = result {
            tracing::error!(error = %e, "Worker error during drain");
        }
    }
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received, draining");
    token.cancel();
}
