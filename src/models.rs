use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// --- Tenant Plans ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Hobby,
    Standard,
    Growth,
    Scale,
    Enterprise,
    System,
}

/// Per-plan concurrency ceilings, constructed once at startup and injected.
/// Enterprise and system ceilings come from configuration.
#[derive(Debug, Clone)]
pub struct PlanPolicy {
    pub enterprise_concurrency: u32,
}

impl PlanPolicy {
    pub fn concurrency_limit(&self, plan: Plan) -> u32 {
        match plan {
            Plan::Free => 2,
            Plan::Hobby => 5,
            Plan::Standard => 10,
            Plan::Growth => 50,
            Plan::Scale => 100,
            Plan::Enterprise | Plan::System => self.enterprise_concurrency,
        }
    }
}

// --- Scrape Options ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Markdown,
    Html,
    RawHtml,
    Links,
    Screenshot,
    ScreenshotFullPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyTier {
    #[default]
    Basic,
    Stealth,
}

/// A scripted page interaction executed by the browser engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { selector: String },
    Wait { milliseconds: u64 },
    ExecuteJavascript { script: String },
    Screenshot { full_page: bool },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Wait { .. } => "wait",
            Action::ExecuteJavascript { .. } => "execute_javascript",
            Action::Screenshot { .. } => "screenshot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOptions {
    #[serde(default = "default_formats")]
    pub formats: Vec<Format>,
    /// Overall deadline for the scrape in milliseconds. Defaults to 300s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Extra settle time the browser engine waits after load.
    #[serde(default)]
    pub wait_for_ms: u64,
    #[serde(default)]
    pub skip_tls_verification: bool,
    #[serde(default = "default_true")]
    pub block_ads: bool,
    #[serde(default)]
    pub proxy: ProxyTier,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub mobile: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub fast_mode: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        ScrapeOptions {
            formats: default_formats(),
            timeout_ms: None,
            headers: HashMap::new(),
            wait_for_ms: 0,
            skip_tls_verification: false,
            block_ads: true,
            proxy: ProxyTier::Basic,
            actions: Vec::new(),
            mobile: false,
            location: None,
            fast_mode: false,
        }
    }
}

fn default_formats() -> Vec<Format> {
    vec![Format::Markdown]
}

fn default_true() -> bool {
    true
}

/// Options set by the platform, never by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_engine: Option<String>,
    #[serde(default)]
    pub zero_data_retention: bool,
    #[serde(default = "default_base_priority")]
    pub base_priority: i32,
}

fn default_base_priority() -> i32 {
    crate::queue::priority::BASE_SINGLE_SCRAPE
}

// --- Jobs ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Single,
    CrawlChild,
    Kickoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub job_id: String,
    pub url: String,
    pub mode: JobMode,
    pub tenant_id: String,
    pub plan: Plan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl_id: Option<String>,
    #[serde(default)]
    pub scrape_options: ScrapeOptions,
    #[serde(default)]
    pub internal_options: InternalOptions,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<Webhook>,
    /// Link-discovery depth relative to the crawl origin. Zero for seeds.
    #[serde(default)]
    pub depth: u32,
}

/// Bookkeeping states for a job. Stalled jobs re-enter pending until the
/// retry budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Succeeded,
    Failed,
    Cancelled,
}

// --- Crawls ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlKind {
    #[default]
    Crawl,
    BatchScrape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerOptions {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub ignore_sitemap: bool,
    #[serde(default)]
    pub ignore_robots_txt: bool,
    #[serde(default)]
    pub allow_external_links: bool,
    #[serde(default)]
    pub allow_backward_links: bool,
    /// Treat `www.`/apex and http/https variants of a URL as one page.
    #[serde(default = "default_true")]
    pub deduplicate_similar_urls: bool,
    /// Drop query strings when deduplicating. Distinct pages that differ only
    /// in their query will be crawled once; leave this off unless the site is
    /// known not to key content on query parameters.
    #[serde(default)]
    pub ignore_query_parameters: bool,
    #[serde(default)]
    pub allow_subdomains: bool,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        CrawlerOptions {
            includes: Vec::new(),
            excludes: Vec::new(),
            max_depth: default_max_depth(),
            limit: default_limit(),
            ignore_sitemap: false,
            ignore_robots_txt: false,
            allow_external_links: false,
            allow_backward_links: false,
            deduplicate_similar_urls: true,
            ignore_query_parameters: false,
            allow_subdomains: false,
        }
    }
}

fn default_max_depth() -> u32 {
    10
}

fn default_limit() -> u32 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crawl {
    pub crawl_id: String,
    pub origin_url: String,
    pub tenant_id: String,
    pub plan: Plan,
    #[serde(default)]
    pub kind: CrawlKind,
    /// Explicit seed list for batch scrapes; crawls expand from `origin_url`.
    #[serde(default)]
    pub seed_urls: Vec<String>,
    #[serde(default)]
    pub crawler_options: CrawlerOptions,
    #[serde(default)]
    pub scrape_options: ScrapeOptions,
    #[serde(default)]
    pub internal_options: InternalOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robots_txt: Option<String>,
    pub created_at: u64,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<Webhook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatusKind {
    Pending,
    Scraping,
    Completed,
    Failed,
    Cancelled,
}

// --- Documents ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub og_tags: HashMap<String, String>,
    pub status_code: u16,
    /// The URL the caller asked for.
    pub source_url: String,
    /// The URL the content was actually served from, after redirects.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of one scrape, holding at most one of each requested format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub metadata: DocumentMetadata,
}

// --- Webhooks ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "crawl.started")]
    CrawlStarted,
    #[serde(rename = "crawl.page")]
    CrawlPage,
    #[serde(rename = "crawl.completed")]
    CrawlCompleted,
    #[serde(rename = "batch_scrape.page")]
    BatchScrapePage,
    #[serde(rename = "batch_scrape.completed")]
    BatchScrapeCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Echoed back verbatim in every delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Events to deliver; empty means all.
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_concurrency_table() {
        let policy = PlanPolicy {
            enterprise_concurrency: 400,
        };
        assert_eq!(policy.concurrency_limit(Plan::Free), 2);
        assert_eq!(policy.concurrency_limit(Plan::Hobby), 5);
        assert_eq!(policy.concurrency_limit(Plan::Standard), 10);
        assert_eq!(policy.concurrency_limit(Plan::Growth), 50);
        assert_eq!(policy.concurrency_limit(Plan::Scale), 100);
        assert_eq!(policy.concurrency_limit(Plan::Enterprise), 400);
        assert_eq!(policy.concurrency_limit(Plan::System), 400);
    }

    #[test]
    fn test_scrape_options_defaults() {
        let options: ScrapeOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.formats, vec![Format::Markdown]);
        assert!(options.block_ads);
        assert!(!options.skip_tls_verification);
        assert_eq!(options.proxy, ProxyTier::Basic);
    }

    #[test]
    fn test_webhook_event_wire_names() {
        let event = serde_json::to_string(&WebhookEvent::CrawlCompleted).unwrap();
        assert_eq!(event, "\"crawl.completed\"");
        let event: WebhookEvent = serde_json::from_str("\"batch_scrape.page\"").unwrap();
        assert_eq!(event, WebhookEvent::BatchScrapePage);
    }

    #[test]
    fn test_job_round_trip() {
        let job = ScrapeJob {
            job_id: "j-1".to_string(),
            url: "https://example.com/".to_string(),
            mode: JobMode::CrawlChild,
            tenant_id: "team-1".to_string(),
            plan: Plan::Standard,
            crawl_id: Some("c-1".to_string()),
            scrape_options: ScrapeOptions::default(),
            internal_options: InternalOptions::default(),
            origin: "api".to_string(),
            webhook: None,
            depth: 2,
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: ScrapeJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode, JobMode::CrawlChild);
        assert_eq!(back.depth, 2);
        assert_eq!(back.crawl_id.as_deref(), Some("c-1"));
    }
}
