use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Parsed robots.txt rules for a single origin, fetched once per crawl.
#[derive(Debug, Clone)]
pub struct RobotsChecker {
    /// Map from lowercase user-agent to list of disallowed path prefixes.
    rules: HashMap<String, Vec<String>>,
    /// Sitemap URLs declared in the file.
    pub sitemaps: Vec<String>,
    /// Whether we successfully fetched and parsed a robots.txt.
    pub loaded: bool,
    /// Raw content, persisted on the crawl record for re-parsing elsewhere.
    pub raw: String,
}

impl RobotsChecker {
    /// Fetch and parse robots.txt for the origin of the given URL. A missing
    /// or unreachable robots.txt allows everything.
    pub async fn fetch(client: &reqwest::Client, origin_url: &str) -> Self {
        let Some(robots_url) = robots_url_for(origin_url) else {
            return Self::from_content("");
        };

        let response = match client
            .get(&robots_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            _ => {
                return RobotsChecker {
                    rules: HashMap::new(),
                    sitemaps: Vec::new(),
                    loaded: false,
                    raw: String::new(),
                }
            }
        };

        let body = response.text().await.unwrap_or_default();
        Self::from_content(&body)
    }

    /// Build a checker from raw robots.txt content.
    pub fn from_content(content: &str) -> Self {
        let (rules, sitemaps) = Self::parse(content);
        RobotsChecker {
            rules,
            sitemaps,
            loaded: !content.is_empty(),
            raw: content.to_string(),
        }
    }

    /// Check if the given URL is allowed for the specified user agent.
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        let path = match Url::parse(url) {
            Ok(u) => u.path().to_string(),
            Err(_) => return true,
        };

        let ua_lower = user_agent.to_lowercase();
        let agents_to_check = [ua_lower.as_str(), "*"];

        for agent in &agents_to_check {
            if let Some(disallowed) = self.rules.get(*agent) {
                for pattern in disallowed {
                    if pattern.is_empty() {
                        // "Disallow:" with empty value means allow all
                        continue;
                    }
                    if path.starts_with(pattern) {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Parse robots.txt content into disallow rules and sitemap declarations.
    fn parse(content: &str) -> (HashMap<String, Vec<String>>, Vec<String>) {
        let mut rules: HashMap<String, Vec<String>> = HashMap::new();
        let mut sitemaps: Vec<String> = Vec::new();
        let mut current_agents: Vec<String> = Vec::new();

        for line in content.lines() {
            let line = line.trim();

            let line = if let Some(idx) = line.find('#') {
                line[..idx].trim()
            } else {
                line
            };

            if line.is_empty() {
                // Empty line resets current user-agent context
                current_agents.clear();
                continue;
            }

            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_lowercase();
                let value = value.trim();

                match key.as_str() {
                    "user-agent" => {
                        current_agents.push(value.to_lowercase());
                    }
                    "disallow" => {
                        for agent in &current_agents {
                            rules
                                .entry(agent.clone())
                                .or_default()
                                .push(value.to_string());
                        }
                    }
                    "sitemap" => {
                        if !value.is_empty() {
                            sitemaps.push(value.to_string());
                        }
                    }
                    _ => {
                        // Allow, Crawl-delay, etc. are not enforced.
                    }
                }
            }
        }

        (rules, sitemaps)
    }
}

/// Source of robots.txt data, injected so tests can skip the network.
#[async_trait::async_trait]
pub trait RobotsProvider: Send + Sync {
    async fn fetch(&self, origin_url: &str) -> RobotsChecker;
}

pub struct HttpRobotsProvider {
    client: reqwest::Client,
}

impl HttpRobotsProvider {
    pub fn new(client: reqwest::Client) -> Self {
        HttpRobotsProvider { client }
    }
}

#[async_trait::async_trait]
impl RobotsProvider for HttpRobotsProvider {
    async fn fetch(&self, origin_url: &str) -> RobotsChecker {
        RobotsChecker::fetch(&self.client, origin_url).await
    }
}

fn robots_url_for(origin_url: &str) -> Option<String> {
    let mut parsed = Url::parse(origin_url).ok()?;
    parsed.set_path("/robots.txt");
    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.to_string())
}
