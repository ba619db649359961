use regex::Regex;
use url::Url;

use crate::models::CrawlerOptions;

use super::robots::RobotsChecker;

/// Hosts that are never worth enqueueing: link farms of logins and consent
/// walls that only waste fetch budget.
const BLOCKLISTED_HOSTS: &[&str] = &[
    "facebook.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "linkedin.com",
    "tiktok.com",
    "youtube.com",
    "pinterest.com",
];

/// Canonicalize a URL for deduplication:
/// - drop the fragment
/// - lowercase scheme and host, drop default ports (the `url` crate does both)
/// - trim the trailing slash from non-root paths
/// - optionally strip `www.` and the query string, per crawl options
///
/// Canonicalization is idempotent.
pub fn normalize_url(raw: &str, options: &CrawlerOptions) -> Option<String> {
    let mut parsed = Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.set_fragment(None);

    if options.ignore_query_parameters {
        parsed.set_query(None);
    }

    if options.deduplicate_similar_urls {
        if let Some(host) = parsed.host_str() {
            if let Some(stripped) = host.strip_prefix("www.") {
                let stripped = stripped.to_string();
                let _ = parsed.set_host(Some(&stripped));
            }
        }
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(&path[..path.len() - 1]);
    }

    Some(parsed.to_string())
}

/// The URL forms treated as one page for locking purposes:
/// {http, https} x {trailing slash, none} x {www., apex}.
///
/// `lock_url` inserts the whole bundle atomically; a URL counts as new only
/// if every permutation was unseen.
pub fn permutations(canonical: &str) -> Vec<String> {
    let Ok(parsed) = Url::parse(canonical) else {
        return vec![canonical.to_string()];
    };
    let Some(host) = parsed.host_str() else {
        return vec![canonical.to_string()];
    };

    let apex = host.strip_prefix("www.").unwrap_or(host).to_string();
    let hosts = [apex.clone(), format!("www.{apex}")];

    let path = parsed.path();
    let mut tail = String::new();
    if let Some(query) = parsed.query() {
        tail.push('?');
        tail.push_str(query);
    }
    let paths: Vec<String> = if path == "/" {
        vec![format!("/{tail}"), tail.clone()]
    } else if let Some(bare) = path.strip_suffix('/') {
        vec![format!("{bare}{tail}"), format!("{path}{tail}")]
    } else {
        vec![format!("{path}{tail}"), format!("{path}/{tail}")]
    };

    let mut bundle = Vec::with_capacity(8);
    for scheme in ["https", "http"] {
        for host in &hosts {
            for path in &paths {
                let form = format!("{scheme}://{host}{path}");
                if !bundle.contains(&form) {
                    bundle.push(form);
                }
            }
        }
    }
    bundle
}

/// Number of path segments, used for the depth rule.
pub fn url_depth(url: &str) -> u32 {
    Url::parse(url)
        .map(|u| {
            u.path()
                .split('/')
                .filter(|segment| !segment.is_empty())
                .count() as u32
        })
        .unwrap_or(0)
}

fn apex_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(|h| h.strip_prefix("www.").unwrap_or(h).to_lowercase())
}

fn is_blocklisted(url: &Url) -> bool {
    let Some(host) = apex_host(url) else {
        return false;
    };
    BLOCKLISTED_HOSTS
        .iter()
        .any(|blocked| host == *blocked || host.ends_with(&format!(".{blocked}")))
}

/// Link admission rules for one crawl, compiled once.
pub struct LinkFilter {
    options: CrawlerOptions,
    origin: Url,
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
    robots: Option<RobotsChecker>,
    user_agent: String,
}

impl LinkFilter {
    pub fn new(
        origin_url: &str,
        options: &CrawlerOptions,
        robots: Option<RobotsChecker>,
        user_agent: &str,
    ) -> Option<Self> {
        let origin = Url::parse(origin_url).ok()?;
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|pattern| match Regex::new(pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        tracing::warn!(pattern = %pattern, error = %e, "Skipping invalid path pattern");
                        None
                    }
                })
                .collect()
        };
        Some(LinkFilter {
            options: options.clone(),
            includes: compile(&options.includes),
            excludes: compile(&options.excludes),
            origin,
            robots,
            user_agent: user_agent.to_string(),
        })
    }

    /// Returns the canonical URL if the link passes every rule, otherwise
    /// `None`.
    pub fn filter(&self, raw_url: &str) -> Option<String> {
        let canonical = normalize_url(raw_url, &self.options)?;
        let parsed = Url::parse(&canonical).ok()?;

        if is_blocklisted(&parsed) {
            return None;
        }

        let link_host = apex_host(&parsed)?;
        let origin_host = apex_host(&self.origin)?;
        if link_host != origin_host {
            let is_subdomain = link_host.ends_with(&format!(".{origin_host}"));
            if is_subdomain {
                if !self.options.allow_subdomains {
                    return None;
                }
            } else if !self.options.allow_external_links {
                return None;
            }
        }

        let path = parsed.path();

        if link_host == origin_host && !self.options.allow_backward_links {
            // Same-or-forward rule: stay under the origin's path prefix.
            let origin_path = self.origin.path().trim_end_matches('/');
            if !origin_path.is_empty() && !path.starts_with(origin_path) {
                return None;
            }
        }

        if self.excludes.iter().any(|regex| regex.is_match(path)) {
            return None;
        }
        if !self.includes.is_empty() && !self.includes.iter().any(|regex| regex.is_match(path)) {
            return None;
        }

        if url_depth(&canonical) > self.options.max_depth {
            return None;
        }

        if !self.options.ignore_robots_txt {
            if let Some(robots) = &self.robots {
                if !robots.is_allowed(&canonical, &self.user_agent) {
                    return None;
                }
            }
        }

        Some(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CrawlerOptions {
        CrawlerOptions::default()
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let cases = [
            "https://Example.com/Path/",
            "https://www.example.com/a?b=1#frag",
            "http://example.com:80/",
        ];
        for raw in cases {
            let once = normalize_url(raw, &options()).unwrap();
            let twice = normalize_url(&once, &options()).unwrap();
            assert_eq!(once, twice, "normalize should be idempotent for {raw}");
        }
    }

    #[test]
    fn test_normalize_strips_fragment_and_trailing_slash() {
        let url = normalize_url("https://example.com/docs/#intro", &options()).unwrap();
        assert_eq!(url, "https://example.com/docs");
    }

    #[test]
    fn test_normalize_strips_www_when_deduplicating() {
        let url = normalize_url("https://www.example.com/a", &options()).unwrap();
        assert_eq!(url, "https://example.com/a");

        let keep_www = CrawlerOptions {
            deduplicate_similar_urls: false,
            ..options()
        };
        let url = normalize_url("https://www.example.com/a", &keep_www).unwrap();
        assert_eq!(url, "https://www.example.com/a");
    }

    #[test]
    fn test_normalize_drops_query_when_configured() {
        let drop_query = CrawlerOptions {
            ignore_query_parameters: true,
            ..options()
        };
        let url = normalize_url("https://site.test/x?y=1", &drop_query).unwrap();
        assert_eq!(url, "https://site.test/x");
    }

    #[test]
    fn test_normalize_rejects_non_http() {
        assert!(normalize_url("mailto:a@example.com", &options()).is_none());
        assert!(normalize_url("javascript:void(0)", &options()).is_none());
    }

    #[test]
    fn test_permutations_cover_scheme_slash_www() {
        let bundle = permutations("https://example.com/docs");
        assert!(bundle.contains(&"https://example.com/docs".to_string()));
        assert!(bundle.contains(&"https://example.com/docs/".to_string()));
        assert!(bundle.contains(&"http://example.com/docs".to_string()));
        assert!(bundle.contains(&"https://www.example.com/docs".to_string()));
        assert_eq!(bundle.len(), 8);
    }

    #[test]
    fn test_permutations_preserve_query() {
        let bundle = permutations("https://example.com/a?x=1");
        assert!(bundle.contains(&"https://example.com/a?x=1".to_string()));
        assert!(bundle.contains(&"https://example.com/a/?x=1".to_string()));
    }

    #[test]
    fn test_url_depth() {
        assert_eq!(url_depth("https://example.com/"), 0);
        assert_eq!(url_depth("https://example.com/a"), 1);
        assert_eq!(url_depth("https://example.com/a/b/c"), 3);
    }

    #[test]
    fn test_filter_rejects_external_links_by_default() {
        let filter = LinkFilter::new("https://site.test/", &options(), None, "bot").unwrap();
        assert!(filter.filter("https://other.test/page").is_none());
        assert!(filter.filter("https://site.test/page").is_some());
    }

    #[test]
    fn test_filter_allows_external_when_configured() {
        let external = CrawlerOptions {
            allow_external_links: true,
            ..options()
        };
        let filter = LinkFilter::new("https://site.test/", &external, None, "bot").unwrap();
        assert!(filter.filter("https://other.test/page").is_some());
    }

    #[test]
    fn test_filter_subdomains() {
        let filter = LinkFilter::new("https://site.test/", &options(), None, "bot").unwrap();
        assert!(filter.filter("https://docs.site.test/a").is_none());

        let subdomains = CrawlerOptions {
            allow_subdomains: true,
            ..options()
        };
        let filter = LinkFilter::new("https://site.test/", &subdomains, None, "bot").unwrap();
        assert!(filter.filter("https://docs.site.test/a").is_some());
    }

    #[test]
    fn test_filter_backward_links() {
        let filter = LinkFilter::new("https://site.test/docs/", &options(), None, "bot").unwrap();
        assert!(filter.filter("https://site.test/docs/guide").is_some());
        assert!(filter.filter("https://site.test/blog/post").is_none());

        let backward = CrawlerOptions {
            allow_backward_links: true,
            ..options()
        };
        let filter = LinkFilter::new("https://site.test/docs/", &backward, None, "bot").unwrap();
        assert!(filter.filter("https://site.test/blog/post").is_some());
    }

    #[test]
    fn test_filter_include_exclude_patterns() {
        let scoped = CrawlerOptions {
            includes: vec!["^/docs/".to_string()],
            excludes: vec!["\\.pdf$".to_string()],
            ..options()
        };
        let filter = LinkFilter::new("https://site.test/", &scoped, None, "bot").unwrap();
        assert!(filter.filter("https://site.test/docs/a").is_some());
        assert!(filter.filter("https://site.test/about").is_none());
        assert!(filter.filter("https://site.test/docs/manual.pdf").is_none());
    }

    #[test]
    fn test_filter_max_depth() {
        let shallow = CrawlerOptions {
            max_depth: 2,
            ..options()
        };
        let filter = LinkFilter::new("https://site.test/", &shallow, None, "bot").unwrap();
        assert!(filter.filter("https://site.test/a/b").is_some());
        assert!(filter.filter("https://site.test/a/b/c").is_none());
    }

    #[test]
    fn test_filter_blocklist() {
        let external = CrawlerOptions {
            allow_external_links: true,
            ..options()
        };
        let filter = LinkFilter::new("https://site.test/", &external, None, "bot").unwrap();
        assert!(filter.filter("https://www.facebook.com/somepage").is_none());
        assert!(filter.filter("https://x.com/user").is_none());
    }

    #[test]
    fn test_filter_respects_robots() {
        let robots = RobotsChecker::from_content("User-agent: *\nDisallow: /private/\n");
        let filter =
            LinkFilter::new("https://site.test/", &options(), Some(robots), "bot").unwrap();
        assert!(filter.filter("https://site.test/private/x").is_none());
        assert!(filter.filter("https://site.test/public").is_some());

        let ignoring = CrawlerOptions {
            ignore_robots_txt: true,
            ..options()
        };
        let robots = RobotsChecker::from_content("User-agent: *\nDisallow: /private/\n");
        let filter =
            LinkFilter::new("https://site.test/", &ignoring, Some(robots), "bot").unwrap();
        assert!(filter.filter("https://site.test/private/x").is_some());
    }
}
