//! Document source client.
//!
//! [`SourceClient`] is the seam to the wiki-style REST API that owns the
//! corpus: enumerate documents with version metadata, fetch full content,
//! and read per-document last-modified timestamps. [`WikiClient`] is the
//! HTTP implementation; the sync controller only ever sees the trait.
//!
//! Also hosts [`html_to_text`], the conversion from raw page HTML to the
//! plain text that gets chunked and embedded.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::SourceConfig;
use crate::error::{classify_status, with_backoff, EngineError};
use crate::models::{ChunkMetadata, DocumentContent, DocumentSummary};

/// Environment variable holding the source API bearer token.
pub const SOURCE_TOKEN_ENV: &str = "SOURCE_API_TOKEN";

/// Read-side contract against the document source.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Enumerate every document in the corpus with its summary metadata.
    /// This list is the change-detection universe.
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>>;

    /// Fetch one document's full content and document-level metadata.
    async fn fetch_document(&self, id: &str) -> Result<DocumentContent>;

    /// The source-reported last-modified timestamp string for a document.
    async fn last_modified(&self, id: &str) -> Result<String>;
}

/// HTTP client for a Confluence-style wiki REST API.
pub struct WikiClient {
    client: reqwest::Client,
    base_url: String,
    space: String,
    page_size: usize,
}

impl WikiClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            bail!("source.base_url must be set");
        }
        if std::env::var(SOURCE_TOKEN_ENV).is_err() {
            bail!("{SOURCE_TOKEN_ENV} environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            space: config.space.clone(),
            page_size: config.page_size.max(1),
        })
    }

    async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, EngineError> {
        let token = std::env::var(SOURCE_TOKEN_ENV)
            .map_err(|_| EngineError::Permanent(format!("{SOURCE_TOKEN_ENV} not set")))?;

        with_backoff(url, || async {
            let resp = self
                .client
                .get(url)
                .query(params)
                .bearer_auth(&token)
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| EngineError::transient(format!("request failed: {e}")))?;

            let status = resp.status();
            if status.is_success() {
                return resp
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| EngineError::Permanent(format!("malformed response: {e}")));
            }

            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let preview: String = resp.text().await.unwrap_or_default().chars().take(300).collect();

            if status.as_u16() == 429 {
                Err(EngineError::rate_limited(
                    format!("HTTP 429: {preview}"),
                    retry_after,
                ))
            } else {
                Err(classify_status(status, &preview))
            }
        })
        .await
    }
}

#[async_trait]
impl SourceClient for WikiClient {
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let url = format!("{}/rest/api/content", self.base_url);
        let mut documents = Vec::new();
        let mut start = 0usize;

        loop {
            let params = [
                ("spaceKey", self.space.clone()),
                ("type", "page".to_string()),
                ("start", start.to_string()),
                ("limit", self.page_size.to_string()),
                ("expand", "version".to_string()),
            ];
            let json = self.get_json(&url, &params).await?;
            let page = parse_document_list(&json, &self.base_url);
            let fetched = json
                .get("results")
                .and_then(|r| r.as_array())
                .map_or(0, |r| r.len());
            documents.extend(page);

            if fetched < self.page_size {
                break;
            }
            start += self.page_size;
        }

        tracing::debug!(count = documents.len(), "enumerated source documents");
        Ok(documents)
    }

    async fn fetch_document(&self, id: &str) -> Result<DocumentContent> {
        let url = format!("{}/rest/api/content/{}", self.base_url, id);
        let params = [("expand", "body.view,version,space,labels".to_string())];
        let json = self.get_json(&url, &params).await?;
        Ok(parse_document_content(&json, id, &self.base_url))
    }

    async fn last_modified(&self, id: &str) -> Result<String> {
        let url = format!("{}/rest/api/content/{}", self.base_url, id);
        let params = [("expand", "version".to_string())];
        let json = self.get_json(&url, &params).await?;
        parse_last_modified(&json)
            .ok_or_else(|| anyhow::anyhow!("document {id}: no last-modified timestamp"))
    }
}

// ============ Response parsing ============

fn parse_document_list(json: &serde_json::Value, base_url: &str) -> Vec<DocumentSummary> {
    let Some(results) = json.get("results").and_then(|r| r.as_array()) else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|page| {
            let id = page.get("id")?;
            // Page ids arrive as either strings or numbers.
            let id = id
                .as_str()
                .map(str::to_string)
                .or_else(|| id.as_i64().map(|n| n.to_string()))?;

            let title = page
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or("(untitled)")
                .to_string();
            let version = page
                .get("version")
                .and_then(|v| v.get("number"))
                .and_then(|n| n.as_i64())
                .unwrap_or(1);

            Some(DocumentSummary {
                url: page_url(base_url, &id),
                id,
                title,
                version,
            })
        })
        .collect()
}

fn parse_document_content(json: &serde_json::Value, id: &str, base_url: &str) -> DocumentContent {
    let body_html = json
        .get("body")
        .and_then(|b| b.get("view"))
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    DocumentContent {
        body_html,
        metadata: extract_document_metadata(json, id, base_url),
    }
}

fn parse_last_modified(json: &serde_json::Value) -> Option<String> {
    let version = json.get("version")?;
    version
        .get("when")
        .or_else(|| version.get("createdAt"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn page_url(base_url: &str, id: &str) -> String {
    format!("{base_url}/pages/viewpage.action?pageId={id}")
}

/// Document-level metadata shared by every chunk of the document.
/// List fields are only inserted when non-empty.
fn extract_document_metadata(json: &serde_json::Value, id: &str, base_url: &str) -> ChunkMetadata {
    let mut meta = ChunkMetadata::new();
    meta.insert("document_id", id);
    meta.insert(
        "title",
        json.get("title")
            .and_then(|t| t.as_str())
            .unwrap_or("(untitled)"),
    );
    meta.insert("url", page_url(base_url, id));
    meta.insert("content_type", "page");

    let version = json.get("version");
    meta.insert(
        "page_version",
        version
            .and_then(|v| v.get("number"))
            .and_then(|n| n.as_i64())
            .unwrap_or(1)
            .to_string(),
    );
    if let Some(when) = version
        .and_then(|v| v.get("when"))
        .and_then(|w| w.as_str())
    {
        meta.insert("last_updated", when);
    }

    if let Some(section) = json
        .get("extensions")
        .and_then(|e| e.get("position"))
        .and_then(|p| p.as_i64())
    {
        meta.insert("section", section.to_string());
    }

    if let Some(space) = json.get("space") {
        if let Some(key) = space.get("key").and_then(|k| k.as_str()) {
            meta.insert("space_key", key);
        }
        if let Some(name) = space.get("name").and_then(|n| n.as_str()) {
            meta.insert("space_name", name);
        }
    }

    let tags: Vec<String> = json
        .get("labels")
        .and_then(|l| l.get("results"))
        .and_then(|r| r.as_array())
        .map(|results| {
            results
                .iter()
                .filter_map(|label| label.get("name").and_then(|n| n.as_str()))
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    meta.insert("tags", tags);

    meta
}

// ============ HTML to text ============

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "table", "tr", "h1", "h2", "h3", "h4", "h5", "h6",
];

/// Convert page HTML to plain text: `<script>`/`<style>` content is
/// dropped, block-level tags become paragraph breaks, entities are
/// decoded, and whitespace is collapsed.
pub fn html_to_text(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }

    let mut result = String::new();
    let mut chars = html.char_indices().peekable();
    let mut skip_until: Option<&str> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(end_tag) = skip_until {
            if c == '<' && html[i..].to_lowercase().starts_with(end_tag) {
                skip_until = None;
                for _ in 0..end_tag.len() - 1 {
                    chars.next();
                }
            }
            continue;
        }

        if c == '<' {
            let rest = &html[i + 1..];
            let tag_end = rest.find('>').map(|p| i + 1 + p).unwrap_or(html.len());
            let tag_body = html[i + 1..tag_end].to_lowercase();
            let tag_name: String = tag_body
                .trim_start_matches('/')
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();

            if tag_name == "script" && !tag_body.starts_with('/') {
                skip_until = Some("</script>");
            } else if tag_name == "style" && !tag_body.starts_with('/') {
                skip_until = Some("</style>");
            } else if BLOCK_TAGS.contains(&tag_name.as_str()) {
                result.push('\n');
            }

            while let Some(&(j, _)) = chars.peek() {
                if j > tag_end {
                    break;
                }
                chars.next();
            }
            continue;
        }

        result.push(c);
    }

    let decoded = decode_entities(&result);

    // Collapse runs of whitespace within lines, blank lines into
    // paragraph breaks.
    let paragraphs: Vec<String> = decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect();
    paragraphs.join("\n\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_text_blocks_and_entities() {
        let html = "<h1>Title</h1><p>First &amp; second.</p><p>Third&nbsp;part.</p>";
        let text = html_to_text(html);
        assert_eq!(text, "Title\n\nFirst & second.\n\nThird part.");
    }

    #[test]
    fn test_html_to_text_drops_script_and_style() {
        let html = "<p>Visible</p><script>alert('x')</script><style>.a{}</style><p>Also visible</p>";
        let text = html_to_text(html);
        assert!(text.contains("Visible"));
        assert!(text.contains("Also visible"));
        assert!(!text.contains("alert"));
        assert!(!text.contains(".a{}"));
    }

    #[test]
    fn test_html_to_text_empty() {
        assert_eq!(html_to_text(""), "");
        assert_eq!(html_to_text("<div></div>"), "");
    }

    #[test]
    fn test_parse_document_list() {
        let json = serde_json::json!({
            "results": [
                { "id": "100", "title": "Alpha", "version": { "number": 3 } },
                { "id": 200, "title": "Beta" },
                { "noid": true },
            ]
        });
        let docs = parse_document_list(&json, "https://wiki.example.com");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "100");
        assert_eq!(docs[0].version, 3);
        assert_eq!(docs[1].id, "200");
        assert_eq!(docs[1].version, 1);
        assert!(docs[0].url.contains("pageId=100"));
    }

    #[test]
    fn test_extract_metadata_tags_collapse() {
        let json = serde_json::json!({
            "title": "Deploy Runbook",
            "version": { "number": 7, "when": "2026-05-02T10:00:00.000Z" },
            "space": { "key": "OPS", "name": "Operations" },
            "labels": { "results": [] },
        });
        let meta = extract_document_metadata(&json, "42", "https://wiki.example.com");
        assert_eq!(meta.title(), Some("Deploy Runbook"));
        assert_eq!(meta.str_field("page_version"), Some("7"));
        assert_eq!(meta.str_field("space_key"), Some("OPS"));
        assert!(meta.tags().is_none(), "empty tags must collapse to absence");
    }

    #[test]
    fn test_extract_metadata_with_tags() {
        let json = serde_json::json!({
            "title": "Page",
            "labels": { "results": [ { "name": "runbook" }, { "name": "" } ] },
        });
        let meta = extract_document_metadata(&json, "7", "https://wiki.example.com");
        assert_eq!(meta.tags(), Some(&["runbook".to_string()][..]));
    }

    #[test]
    fn test_parse_last_modified_fallback() {
        let when = serde_json::json!({ "version": { "when": "2026-01-01T00:00:00Z" } });
        assert_eq!(
            parse_last_modified(&when).as_deref(),
            Some("2026-01-01T00:00:00Z")
        );

        let created = serde_json::json!({ "version": { "createdAt": "2025-12-01T00:00:00Z" } });
        assert_eq!(
            parse_last_modified(&created).as_deref(),
            Some("2025-12-01T00:00:00Z")
        );

        assert_eq!(parse_last_modified(&serde_json::json!({})), None);
    }
}
