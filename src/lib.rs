pub mod config;
pub mod crawl;
pub mod engine;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod store;
pub mod webhook;
pub mod worker;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::crawl::CrawlRegistry;
use crate::queue::admission::ConcurrencyManager;
use crate::queue::priority::PriorityScorer;
use crate::queue::JobScheduler;

/// Shared application state passed to all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub scheduler: JobScheduler,
    pub admission: Arc<ConcurrencyManager>,
    pub scorer: PriorityScorer,
    pub registry: CrawlRegistry,
}

pub fn build_app(state: AppState) -> Router {
    // CORS layer — permissive for the internal service
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Routes that require HMAC authentication
    let authenticated_routes = Router::new()
        .route("/api/v1/scrape", post(server::routes::submit_scrape))
        .route("/api/v1/scrape/{id}", get(server::routes::get_scrape))
        .route("/api/v1/crawl", post(server::routes::submit_crawl))
        .route("/api/v1/batch", post(server::routes::submit_batch))
        .route("/api/v1/crawl/{id}", get(server::routes::crawl_status))
        .route("/api/v1/crawl/{id}", delete(server::routes::crawl_cancel))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            server::auth::verify_hmac,
        ));

    // Public routes (no auth required)
    let public_routes = Router::new().route("/api/v1/health", get(server::routes::health));

    // Combine all routes
    Router::new()
        .merge(authenticated_routes)
        .merge(public_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
