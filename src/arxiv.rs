//! arXiv search adapter.
//!
//! Queries the arXiv Atom API, newest submissions first, and parses feed
//! entries into discovered papers. Multi-word keywords are quoted so arXiv
//! treats them as phrases; results are keyed by the versionless arXiv id.

use crate::error::{ResearchError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const ARXIV_API_BASE: &str = "https://export.arxiv.org/api";
const REQUEST_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("paperfunnel/", env!("CARGO_PKG_VERSION"));

/// A paper as returned by the search stage, before any persistence.
#[derive(Debug, Clone)]
pub struct DiscoveredPaper {
    /// Versionless arXiv identifier, e.g. "2301.00001"
    pub arxiv_id: String,
    pub title: String,
    /// Author names joined with ", "
    pub authors: String,
    pub abstract_text: String,
    /// Publication date as YYYY-MM-DD when present
    pub published_date: Option<String>,
    pub arxiv_url: String,
    pub pdf_url: String,
}

/// A source of candidate papers for a keyword query.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Fetch one page of results for `query`, starting at `offset`.
    async fn search(
        &self,
        query: &str,
        max_results: usize,
        offset: usize,
    ) -> Result<Vec<DiscoveredPaper>>;
}

pub struct ArxivClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl ArxivClient {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ResearchError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, retry })
    }

    async fn fetch_feed(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(ResearchError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30);
            return Err(ResearchError::RateLimited(retry_after));
        }
        if !status.is_success() {
            return Err(ResearchError::Api {
                code: status.as_u16() as i32,
                message: format!("arXiv API returned {status}"),
            });
        }

        response.text().await.map_err(ResearchError::Network)
    }
}

#[async_trait]
impl SearchIndex for ArxivClient {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
        offset: usize,
    ) -> Result<Vec<DiscoveredPaper>> {
        let url = build_search_url(query, max_results, offset)?;
        debug!(%url, "Fetching arXiv result page");

        let xml = self.retry.run("arxiv search", || self.fetch_feed(&url)).await?;
        let papers = parse_feed(&xml)?;
        debug!(count = papers.len(), offset, "Parsed arXiv feed page");
        Ok(papers)
    }
}

/// Join keywords into one arXiv query, quoting multi-word phrases.
pub fn build_query(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|k| {
            let term = k.trim();
            if term.contains(' ') {
                format!("all:\"{term}\"")
            } else {
                format!("all:{term}")
            }
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn build_search_url(query: &str, max_results: usize, offset: usize) -> Result<Url> {
    let mut url = Url::parse(&format!("{ARXIV_API_BASE}/query"))
        .map_err(|e| ResearchError::Config(format!("Invalid base URL: {e}")))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("search_query", query);
        params.append_pair("start", &offset.to_string());
        params.append_pair("max_results", &max_results.to_string());
        params.append_pair("sortBy", "submittedDate");
        params.append_pair("sortOrder", "descending");
    }

    Ok(url)
}

/// Drop a trailing version suffix ("2301.00001v3" -> "2301.00001").
fn strip_version(arxiv_id: &str) -> String {
    match Regex::new(r"v\d+$") {
        Ok(re) => re.replace(arxiv_id, "").into_owned(),
        Err(_) => arxiv_id.to_string(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an arXiv Atom feed into discovered papers.
///
/// Entries missing an id or title are skipped with a warning rather than
/// failing the page.
fn parse_feed(xml: &str) -> Result<Vec<DiscoveredPaper>> {
    let document = Html::parse_document(xml);

    let entry_selector =
        Selector::parse("entry").map_err(|e| ResearchError::Parse(format!("Invalid selector: {e}")))?;
    let id_selector =
        Selector::parse("id").map_err(|e| ResearchError::Parse(format!("Invalid selector: {e}")))?;
    let title_selector =
        Selector::parse("title").map_err(|e| ResearchError::Parse(format!("Invalid selector: {e}")))?;
    let summary_selector = Selector::parse("summary")
        .map_err(|e| ResearchError::Parse(format!("Invalid selector: {e}")))?;
    let author_selector = Selector::parse("author name")
        .map_err(|e| ResearchError::Parse(format!("Invalid selector: {e}")))?;
    let published_selector = Selector::parse("published")
        .map_err(|e| ResearchError::Parse(format!("Invalid selector: {e}")))?;
    let pdf_link_selector = Selector::parse("link[title=\"pdf\"]")
        .map_err(|e| ResearchError::Parse(format!("Invalid selector: {e}")))?;

    let mut papers = Vec::new();
    for entry in document.select(&entry_selector) {
        let id_url = match entry.select(&id_selector).next() {
            Some(el) => el.text().collect::<String>().trim().to_string(),
            None => {
                warn!("Skipping feed entry without an id");
                continue;
            }
        };
        let raw_id = id_url.rsplit('/').next().unwrap_or_default();
        let arxiv_id = strip_version(raw_id);
        if arxiv_id.is_empty() {
            warn!(%id_url, "Skipping feed entry with unparseable id");
            continue;
        }

        let title = entry
            .select(&title_selector)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()));
        let title = match title {
            Some(t) if !t.is_empty() => t,
            _ => {
                warn!(%arxiv_id, "Skipping feed entry without a title");
                continue;
            }
        };

        let abstract_text = entry
            .select(&summary_selector)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .unwrap_or_default();

        let authors = entry
            .select(&author_selector)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        let published_date = entry
            .select(&published_selector)
            .next()
            .map(|el| el.text().collect::<String>())
            .and_then(|ts| ts.trim().split('T').next().map(str::to_string))
            .filter(|date| !date.is_empty());

        let pdf_url = entry
            .select(&pdf_link_selector)
            .next()
            .and_then(|el| el.value().attr("href").map(str::to_string))
            .unwrap_or_else(|| format!("https://arxiv.org/pdf/{arxiv_id}"));

        papers.push(DiscoveredPaper {
            arxiv_id,
            title,
            authors,
            abstract_text,
            published_date,
            arxiv_url: id_url,
            pdf_url,
        });
    }

    Ok(papers)
}
