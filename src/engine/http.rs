use std::collections::HashMap;
use std::io::Write;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use tokio::sync::RwLock;
use url::Url;

use super::{EngineDescriptor, EngineRequest, EngineResponse, Feature, ScrapeEngine};
use crate::error::{PrefetchArtifact, ScrapeError};

type DomainLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

const ENGINE_NAME: &str = "http";

/// Plain HTTP fetch engine with per-domain rate limiting.
///
/// Each domain gets its own limiter so one slow site cannot starve fetches
/// to every other host. Responses whose content type turns out to be a
/// PDF/DOCX are spilled to a temp file and handed back to the pipeline as an
/// `AddFeatures` restart.
pub struct HttpEngine {
    client: Client,
    insecure_client: Client,
    domain_limiters: Arc<RwLock<HashMap<String, Arc<DomainLimiter>>>>,
    rate_per_second: u32,
}

impl HttpEngine {
    pub fn new(rate_per_second: u32, user_agent: &str) -> Self {
        let build = |skip_tls: bool| {
            let mut builder = Client::builder()
                .user_agent(user_agent)
                .redirect(reqwest::redirect::Policy::limited(10))
                .gzip(true)
                .pool_max_idle_per_host(20);
            if skip_tls {
                builder = builder.danger_accept_invalid_certs(true);
            }
            builder.build().expect("Failed to build HTTP client")
        };

        HttpEngine {
            client: build(false),
            insecure_client: build(true),
            domain_limiters: Arc::new(RwLock::new(HashMap::new())),
            rate_per_second: rate_per_second.max(1),
        }
    }

    async fn get_limiter(&self, domain: &str) -> Arc<DomainLimiter> {
        // Fast path: check read lock
        {
            let limiters = self.domain_limiters.read().await;
            if let Some(limiter) = limiters.get(domain) {
                return limiter.clone();
            }
        }

        // Slow path: create new limiter under write lock
        let mut limiters = self.domain_limiters.write().await;
        limiters
            .entry(domain.to_string())
            .or_insert_with(|| {
                let rate = NonZeroU32::new(self.rate_per_second).unwrap_or(nonzero!(1u32));
                let quota = Quota::per_second(rate);
                Arc::new(RateLimiter::direct(quota))
            })
            .clone()
    }
}

fn classify(error: reqwest::Error, url: &str) -> ScrapeError {
    let text = error.to_string();
    let lowered = text.to_lowercase();
    if error.is_timeout() {
        return ScrapeError::Engine {
            engine: ENGINE_NAME.to_string(),
            message: "request timed out".to_string(),
        };
    }
    if lowered.contains("dns") || lowered.contains("failed to lookup") {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| url.to_string());
        return ScrapeError::DnsResolution { host };
    }
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
        return ScrapeError::Ssl { message: text };
    }
    ScrapeError::Engine {
        engine: ENGINE_NAME.to_string(),
        message: text,
    }
}

/// Content types that promote the scrape into the document pipeline.
fn document_feature(content_type: &str) -> Option<Feature> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_lowercase();
    match essence.as_str() {
        "application/pdf" => Some(Feature::PDF),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/msword" => Some(Feature::DOCX),
        _ => None,
    }
}

fn is_unsupported_media(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_lowercase();
    essence.starts_with("image/")
        || essence.starts_with("video/")
        || essence.starts_with("audio/")
        || essence == "application/zip"
}

#[async_trait]
impl ScrapeEngine for HttpEngine {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            name: ENGINE_NAME,
            capabilities: Feature::SKIP_TLS | Feature::FAST_MODE | Feature::LOCATION,
            quality: 5,
        }
    }

    async fn scrape(&self, request: &EngineRequest) -> Result<EngineResponse, ScrapeError> {
        let domain = Url::parse(&request.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_default();
        let limiter = self.get_limiter(&domain).await;
        limiter.until_ready().await;

        let client = if request.options.skip_tls_verification {
            &self.insecure_client
        } else {
            &self.client
        };

        let mut builder = client
            .get(&request.url)
            .timeout(request.time_budget.max(Duration::from_millis(1)));
        for (name, value) in &request.options.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, &request.url))?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        if let Some(ct) = &content_type {
            if let Some(needed) = document_feature(ct) {
                if !request.features.contains(needed) {
                    // Spill the body we already paid for so the document
                    // engine can skip the re-fetch.
                    let body = response.bytes().await.map_err(|e| classify(e, &request.url))?;
                    let mut file = tempfile::NamedTempFile::new().map_err(|e| {
                        ScrapeError::Engine {
                            engine: ENGINE_NAME.to_string(),
                            message: format!("prefetch spill failed: {e}"),
                        }
                    })?;
                    file.write_all(&body).map_err(|e| ScrapeError::Engine {
                        engine: ENGINE_NAME.to_string(),
                        message: format!("prefetch spill failed: {e}"),
                    })?;
                    return Err(ScrapeError::AddFeatures {
                        flags: needed,
                        pdf_prefetch: Some(PrefetchArtifact {
                            path: file.into_temp_path(),
                            status_code,
                            content_type: ct.clone(),
                        }),
                    });
                }
            } else if is_unsupported_media(ct) {
                return Err(ScrapeError::UnsupportedFile {
                    reason: format!("content type {ct} is not scrapeable"),
                });
            }
        }

        let body = response.text().await.map_err(|e| classify(e, &request.url))?;

        Ok(EngineResponse {
            url: final_url,
            status_code,
            html: Some(body),
            content_type,
            screenshot: None,
            error: None,
        })
    }
}
