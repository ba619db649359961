use async_recursion::async_recursion;
use regex::Regex;
use url::Url;

/// One URL discovered in a sitemap, with its optional priority hint.
#[derive(Debug, Clone)]
pub struct SitemapEntry {
    pub url: String,
    pub priority: Option<f64>,
}

/// How many child sitemaps of an index we follow, and how deep indexes may
/// nest. Keeps pathological sitemap graphs bounded.
const MAX_CHILD_SITEMAPS: usize = 5;
const MAX_INDEX_DEPTH: u32 = 2;

/// Discover sitemap URLs for a crawl origin.
///
/// Tries the sitemaps declared in robots.txt first, then the conventional
/// `/sitemap.xml` and `/sitemap_index.xml` locations. Results are
/// deduplicated and keep sitemap order.
pub async fn discover(
    client: &reqwest::Client,
    origin_url: &str,
    robots_sitemaps: &[String],
) -> Vec<SitemapEntry> {
    let mut candidates: Vec<String> = robots_sitemaps.to_vec();
    if candidates.is_empty() {
        for variant in ["/sitemap.xml", "/sitemap_index.xml"] {
            if let Some(url) = with_path(origin_url, variant) {
                candidates.push(url);
            }
        }
    }

    let mut entries = Vec::new();
    for candidate in candidates {
        fetch_sitemap(client, &candidate, 0, &mut entries).await;
        if !entries.is_empty() {
            break;
        }
    }

    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.url.clone()))
        .collect()
}

/// Source of sitemap entries, injected so tests can skip the network.
#[async_trait::async_trait]
pub trait SitemapProvider: Send + Sync {
    async fn discover(&self, origin_url: &str, robots_sitemaps: &[String]) -> Vec<SitemapEntry>;
}

pub struct HttpSitemapProvider {
    client: reqwest::Client,
}

impl HttpSitemapProvider {
    pub fn new(client: reqwest::Client) -> Self {
        HttpSitemapProvider { client }
    }
}

#[async_trait::async_trait]
impl SitemapProvider for HttpSitemapProvider {
    async fn discover(&self, origin_url: &str, robots_sitemaps: &[String]) -> Vec<SitemapEntry> {
        discover(&self.client, origin_url, robots_sitemaps).await
    }
}

#[async_recursion]
async fn fetch_sitemap(
    client: &reqwest::Client,
    sitemap_url: &str,
    depth: u32,
    out: &mut Vec<SitemapEntry>,
) {
    let Some(xml) = fetch_xml(client, sitemap_url).await else {
        return;
    };

    if xml.contains("<sitemapindex") {
        if depth >= MAX_INDEX_DEPTH {
            tracing::debug!(sitemap = %sitemap_url, "Sitemap index nesting too deep, stopping");
            return;
        }
        let children: Vec<String> = loc_regex()
            .captures_iter(&xml)
            .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
            .take(MAX_CHILD_SITEMAPS)
            .collect();
        for child in children {
            fetch_sitemap(client, &child, depth + 1, out).await;
        }
    } else {
        extract_entries(&xml, out);
    }
}

async fn fetch_xml(client: &reqwest::Client, url: &str) -> Option<String> {
    let resp = client
        .get(url)
        .timeout(std::time::Duration::from_secs(15))
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.text().await.ok()
}

fn loc_regex() -> Regex {
    Regex::new(r"<loc>\s*(.*?)\s*</loc>").expect("valid regex")
}

/// Extract `<url>` blocks with their `<loc>` and optional `<priority>`.
fn extract_entries(xml: &str, out: &mut Vec<SitemapEntry>) {
    let block_re = Regex::new(r"(?s)<url>(.*?)</url>").expect("valid regex");
    let loc_re = loc_regex();
    let priority_re = Regex::new(r"<priority>\s*([0-9.]+)\s*</priority>").expect("valid regex");

    let mut matched_blocks = false;
    for block in block_re.captures_iter(xml) {
        matched_blocks = true;
        let body = block.get(1).map(|m| m.as_str()).unwrap_or_default();
        let Some(loc) = loc_re
            .captures(body)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().trim())
        else {
            continue;
        };
        if loc.is_empty() {
            continue;
        }
        let priority = priority_re
            .captures(body)
            .and_then(|cap| cap.get(1))
            .and_then(|m| m.as_str().parse().ok());
        out.push(SitemapEntry {
            url: loc.to_string(),
            priority,
        });
    }

    // Some sitemaps skip <url> wrappers entirely; fall back to bare <loc>s.
    if !matched_blocks {
        for cap in loc_re.captures_iter(xml) {
            if let Some(loc) = cap.get(1) {
                let url = loc.as_str().trim();
                if !url.is_empty() {
                    out.push(SitemapEntry {
                        url: url.to_string(),
                        priority: None,
                    });
                }
            }
        }
    }
}

fn with_path(origin_url: &str, path: &str) -> Option<String> {
    let mut parsed = Url::parse(origin_url).ok()?;
    parsed.set_path(path);
    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.to_string())
}
