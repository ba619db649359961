use std::collections::HashMap;

use lol_html::{element, HtmlRewriter, Settings};
use scraper::{Html, Selector};
use url::Url;

use crate::engine::EngineResponse;
use crate::models::{Document, DocumentMetadata, Format, ScrapeOptions};

/// A transformed scrape: the caller-facing document plus every link found on
/// the page, which crawls consume even when the caller did not ask for the
/// links format.
#[derive(Debug, Clone)]
pub struct TransformedPage {
    pub document: Document,
    pub discovered_links: Vec<String>,
}

/// Turn a raw engine response into the requested document formats.
pub fn transform(
    source_url: &str,
    response: EngineResponse,
    options: &ScrapeOptions,
) -> TransformedPage {
    let mut metadata = DocumentMetadata {
        status_code: response.status_code,
        source_url: source_url.to_string(),
        url: response.url.clone(),
        error: response.error.clone(),
        ..DocumentMetadata::default()
    };

    let body = response.html.unwrap_or_default();
    let base = Url::parse(&response.url).ok();

    let is_json = response
        .content_type
        .as_deref()
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim() == "application/json")
        .unwrap_or(false);

    if is_json {
        // JSON bodies pass through untouched; there is no page to parse.
        let document = Document {
            markdown: Some(body.clone()),
            raw_html: options
                .formats
                .contains(&Format::RawHtml)
                .then(|| body.clone()),
            metadata,
            ..Document::default()
        };
        return TransformedPage {
            document,
            discovered_links: Vec::new(),
        };
    }

    let parsed = Html::parse_document(&body);
    extract_metadata(&parsed, &mut metadata);
    let discovered_links = extract_links(&parsed, base.as_ref());

    let mut document = Document {
        metadata,
        ..Document::default()
    };

    for format in &options.formats {
        match format {
            Format::Markdown => {
                document.markdown = Some(to_markdown(&body));
            }
            Format::Html => {
                document.html = Some(
                    base.as_ref()
                        .and_then(|b| rewrite_absolute(&body, b))
                        .unwrap_or_else(|| body.clone()),
                );
            }
            Format::RawHtml => {
                document.raw_html = Some(body.clone());
            }
            Format::Links => {
                document.links = Some(discovered_links.clone());
            }
            Format::Screenshot | Format::ScreenshotFullPage => {
                document.screenshot = response.screenshot.clone();
            }
        }
    }

    TransformedPage {
        document,
        discovered_links,
    }
}

fn to_markdown(html: &str) -> String {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "noscript"])
        .build();
    converter.convert(html).unwrap_or_default()
}

fn extract_metadata(document: &Html, metadata: &mut DocumentMetadata) {
    let title_sel = Selector::parse("title").unwrap();
    metadata.title = document
        .select(&title_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());

    let description_sel = Selector::parse(r#"meta[name="description"]"#).unwrap();
    metadata.description = document
        .select(&description_sel)
        .next()
        .and_then(|el| el.value().attr("content").map(|s| s.to_string()))
        .filter(|s| !s.is_empty());

    let og_sel = Selector::parse(r#"meta[property^="og:"]"#).unwrap();
    let mut og_tags = HashMap::new();
    for el in document.select(&og_sel) {
        if let (Some(property), Some(content)) =
            (el.value().attr("property"), el.value().attr("content"))
        {
            og_tags.insert(property.to_string(), content.to_string());
        }
    }
    metadata.og_tags = og_tags;
}

/// All `<a href>` targets resolved to absolute http(s) URLs, in document
/// order, deduplicated.
fn extract_links(document: &Html, base: Option<&Url>) -> Vec<String> {
    let sel = Selector::parse("a[href]").unwrap();
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for el in document.select(&sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let resolved = match base {
            Some(base) => base.join(href.trim()).ok(),
            None => Url::parse(href.trim()).ok(),
        };
        let Some(resolved) = resolved else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        let absolute = resolved.to_string();
        if seen.insert(absolute.clone()) {
            links.push(absolute);
        }
    }
    links
}

fn rewrite_attr(el: &mut lol_html::html_content::Element, attr: &str, base: &Url) {
    if let Some(value) = el.get_attribute(attr) {
        if let Ok(absolute) = base.join(value.trim()) {
            let _ = el.set_attribute(attr, absolute.as_str());
        }
    }
}

/// Rewrite relative link and asset URLs to absolute, streaming through the
/// document without building a tree.
fn rewrite_absolute(html: &str, base: &Url) -> Option<String> {
    let mut output = Vec::new();
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("a[href]", |el| {
                    rewrite_attr(el, "href", base);
                    Ok(())
                }),
                element!("link[href]", |el| {
                    rewrite_attr(el, "href", base);
                    Ok(())
                }),
                element!("img[src]", |el| {
                    rewrite_attr(el, "src", base);
                    Ok(())
                }),
                element!("script[src]", |el| {
                    rewrite_attr(el, "src", base);
                    Ok(())
                }),
            ],
            ..Settings::new()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter.write(html.as_bytes()).ok()?;
    rewriter.end().ok()?;
    String::from_utf8(output).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(html: &str) -> EngineResponse {
        EngineResponse {
            url: "https://example.com/docs/page".to_string(),
            status_code: 200,
            html: Some(html.to_string()),
            content_type: Some("text/html; charset=utf-8".to_string()),
            screenshot: None,
            error: None,
        }
    }

    #[test]
    fn test_markdown_from_simple_page() {
        let page = transform(
            "https://example.com/docs/page",
            response("<html><body>Hi</body></html>"),
            &ScrapeOptions::default(),
        );
        assert_eq!(page.document.markdown.as_deref().map(str::trim), Some("Hi"));
        assert_eq!(page.document.metadata.status_code, 200);
        assert_eq!(page.document.metadata.url, "https://example.com/docs/page");
    }

    #[test]
    fn test_metadata_extraction() {
        let html = r#"<html><head>
            <title>My Page</title>
            <meta name="description" content="A test page">
            <meta property="og:title" content="OG Title">
        </head><body></body></html>"#;
        let page = transform("https://example.com/", response(html), &ScrapeOptions::default());
        let metadata = &page.document.metadata;
        assert_eq!(metadata.title.as_deref(), Some("My Page"));
        assert_eq!(metadata.description.as_deref(), Some("A test page"));
        assert_eq!(metadata.og_tags.get("og:title").map(String::as_str), Some("OG Title"));
    }

    #[test]
    fn test_links_resolved_in_document_order() {
        let html = r#"<body>
            <a href="/a">A</a>
            <a href="b">B</a>
            <a href="https://other.test/c">C</a>
            <a href="mailto:x@y.z">mail</a>
            <a href="/a">A again</a>
        </body>"#;
        let options = ScrapeOptions {
            formats: vec![Format::Links],
            ..ScrapeOptions::default()
        };
        let page = transform("https://example.com/docs/page", response(html), &options);
        assert_eq!(
            page.document.links.unwrap(),
            vec![
                "https://example.com/a",
                "https://example.com/docs/b",
                "https://other.test/c",
            ]
        );
    }

    #[test]
    fn test_html_format_rewrites_relative_urls() {
        let html = r#"<body><a href="/about">About</a><img src="logo.png"></body>"#;
        let options = ScrapeOptions {
            formats: vec![Format::Html, Format::RawHtml],
            ..ScrapeOptions::default()
        };
        let page = transform("https://example.com/docs/page", response(html), &options);
        let rewritten = page.document.html.unwrap();
        assert!(rewritten.contains(r#"href="https://example.com/about""#));
        assert!(rewritten.contains(r#"src="https://example.com/docs/logo.png""#));
        // raw_html stays untouched
        assert_eq!(page.document.raw_html.as_deref(), Some(html));
    }

    #[test]
    fn test_json_body_passes_through() {
        let mut resp = response(r#"{"ok":true}"#);
        resp.content_type = Some("application/json".to_string());
        let page = transform("https://api.test/data", resp, &ScrapeOptions::default());
        assert_eq!(page.document.markdown.as_deref(), Some(r#"{"ok":true}"#));
        assert!(page.discovered_links.is_empty());
    }

    #[test]
    fn test_error_response_still_becomes_document() {
        let resp = EngineResponse {
            url: "https://example.com/missing".to_string(),
            status_code: 404,
            html: Some(String::new()),
            content_type: Some("text/html".to_string()),
            screenshot: None,
            error: None,
        };
        let page = transform("https://example.com/missing", resp, &ScrapeOptions::default());
        assert_eq!(page.document.metadata.status_code, 404);
    }
}
