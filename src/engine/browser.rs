use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::{EngineDescriptor, EngineRequest, EngineResponse, Feature, ScrapeEngine};
use crate::error::ScrapeError;
use crate::models::Action;

const ENGINE_NAME: &str = "browser";

/// Request handed to the headless browser script on argv, as JSON.
#[derive(Debug, Serialize)]
struct BrowserRequest<'a> {
    url: &'a str,
    wait_for_ms: u64,
    mobile: bool,
    skip_tls: bool,
    block_ads: bool,
    stealth_proxy: bool,
    screenshot: bool,
    full_page_screenshot: bool,
    actions: &'a [Action],
    headers: &'a std::collections::HashMap<String, String>,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct BrowserOutput {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    html: Option<String>,
    /// Base64-encoded image produced by the script.
    #[serde(default)]
    screenshot: Option<String>,
    #[serde(default)]
    error: Option<String>,
    /// Chromium net error code like ERR_NAME_NOT_RESOLVED, when the page
    /// itself failed to load.
    #[serde(default)]
    site_code: Option<String>,
    /// Index of the scripted action that failed, if one did.
    #[serde(default)]
    failed_action_index: Option<usize>,
}

/// Headless browser engine driven over a subprocess JSON protocol.
///
/// The node script owns the browser pool; this side only enforces the
/// concurrency cap and the time budget, and maps script output onto the
/// pipeline's error taxonomy.
pub struct BrowserEngine {
    semaphore: Arc<Semaphore>,
    script_path: String,
}

impl BrowserEngine {
    pub fn new(script_path: String, max_concurrent: usize) -> Self {
        BrowserEngine {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            script_path,
        }
    }

    fn parse_output(&self, stdout: &str, request: &EngineRequest) -> Result<EngineResponse, ScrapeError> {
        let parsed: BrowserOutput =
            serde_json::from_str(stdout).map_err(|e| ScrapeError::Engine {
                engine: ENGINE_NAME.to_string(),
                message: format!("unparseable script output: {e}"),
            })?;

        if let Some(index) = parsed.failed_action_index {
            let kind = request
                .options
                .actions
                .get(index)
                .map(|action| action.kind().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ScrapeError::Action { index, kind });
        }

        if let Some(code) = parsed.site_code {
            if code == "ERR_NAME_NOT_RESOLVED" {
                let host = url::Url::parse(&request.url)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.to_string()))
                    .unwrap_or_else(|| request.url.clone());
                return Err(ScrapeError::DnsResolution { host });
            }
            if code.contains("CERT") || code.contains("SSL") {
                return Err(ScrapeError::Ssl { message: code });
            }
            return Err(ScrapeError::Site { code });
        }

        if let Some(error) = parsed.error {
            return Err(ScrapeError::Engine {
                engine: ENGINE_NAME.to_string(),
                message: error,
            });
        }

        Ok(EngineResponse {
            url: parsed.url.unwrap_or_else(|| request.url.clone()),
            status_code: parsed.status_code.unwrap_or(200),
            html: parsed.html,
            content_type: Some("text/html".to_string()),
            screenshot: parsed.screenshot,
            error: None,
        })
    }
}

#[async_trait]
impl ScrapeEngine for BrowserEngine {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            name: ENGINE_NAME,
            capabilities: Feature::ACTIONS
                | Feature::WAIT_FOR
                | Feature::SCREENSHOT
                | Feature::FULL_PAGE_SCREENSHOT
                | Feature::MOBILE
                | Feature::SKIP_TLS
                | Feature::STEALTH_PROXY
                | Feature::DISABLE_ADBLOCK,
            quality: 10,
        }
    }

    async fn scrape(&self, request: &EngineRequest) -> Result<EngineResponse, ScrapeError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ScrapeError::Engine {
                engine: ENGINE_NAME.to_string(),
                message: e.to_string(),
            })?;

        let wants_screenshot = request.features.contains(Feature::SCREENSHOT)
            || request.features.contains(Feature::FULL_PAGE_SCREENSHOT);
        let payload = serde_json::to_string(&BrowserRequest {
            url: &request.url,
            wait_for_ms: request.options.wait_for_ms,
            mobile: request.options.mobile,
            skip_tls: request.options.skip_tls_verification,
            block_ads: request.options.block_ads,
            stealth_proxy: request.features.contains(Feature::STEALTH_PROXY),
            screenshot: wants_screenshot,
            full_page_screenshot: request.features.contains(Feature::FULL_PAGE_SCREENSHOT),
            actions: &request.options.actions,
            headers: &request.options.headers,
            timeout_ms: request.time_budget.as_millis() as u64,
        })
        .map_err(|e| ScrapeError::Engine {
            engine: ENGINE_NAME.to_string(),
            message: e.to_string(),
        })?;

        let output = tokio::time::timeout(
            request.time_budget,
            tokio::process::Command::new("node")
                .arg(&self.script_path)
                .arg(payload)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ScrapeError::Timeout {
            budget_ms: request.time_budget.as_millis() as u64,
        })?
        .map_err(|e| ScrapeError::Engine {
            engine: ENGINE_NAME.to_string(),
            message: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        self.parse_output(&stdout, request)
    }
}
