pub mod arxiv;
pub mod biorxiv;
pub mod crossref;
pub mod google_scholar;
pub mod huggingface;
pub mod iacr;
pub mod pubmed;
pub mod sci_hub;
pub mod searxng;
pub mod semantic_scholar;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::CONTENT_TYPE;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const USER_AGENT: &str = "scholar-hub/0.1 (academic paper search)";

/// Browser-like user agent for the scraped sources.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Every platform the hub knows how to talk to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Arxiv,
    Pubmed,
    Biorxiv,
    Medrxiv,
    Semantic,
    Crossref,
    Iacr,
    GoogleScholar,
    Searxng,
    SciHub,
    Huggingface,
}

impl Source {
    pub const ALL: [Source; 11] = [
        Source::Arxiv,
        Source::Pubmed,
        Source::Biorxiv,
        Source::Medrxiv,
        Source::Semantic,
        Source::Crossref,
        Source::Iacr,
        Source::GoogleScholar,
        Source::Searxng,
        Source::SciHub,
        Source::Huggingface,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Arxiv => "arxiv",
            Source::Pubmed => "pubmed",
            Source::Biorxiv => "biorxiv",
            Source::Medrxiv => "medrxiv",
            Source::Semantic => "semantic",
            Source::Crossref => "crossref",
            Source::Iacr => "iacr",
            Source::GoogleScholar => "google_scholar",
            Source::Searxng => "searxng",
            Source::SciHub => "sci_hub",
            Source::Huggingface => "huggingface",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Source::Arxiv => "arXiv - Open access preprint repository",
            Source::Pubmed => "PubMed - Biomedical literature database",
            Source::Biorxiv => "bioRxiv - Preprint server for biology",
            Source::Medrxiv => "medRxiv - Preprint server for health sciences",
            Source::Semantic => "Semantic Scholar - AI-powered research tool",
            Source::Crossref => "CrossRef - Citation linking service",
            Source::Iacr => "IACR ePrint - Cryptology preprint archive",
            Source::GoogleScholar => "Google Scholar - Academic search engine",
            Source::Searxng => "SearXNG - Privacy-focused metasearch engine",
            Source::SciHub => "Sci-Hub - PDF mirror lookup by DOI or URL",
            Source::Huggingface => "Hugging Face - Papers indexed on the Hub",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source '{0}'")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        let source = match normalized.as_str() {
            "arxiv" => Source::Arxiv,
            "pubmed" => Source::Pubmed,
            "biorxiv" => Source::Biorxiv,
            "medrxiv" => Source::Medrxiv,
            "semantic" | "semantic_scholar" | "s2" => Source::Semantic,
            "crossref" => Source::Crossref,
            "iacr" => Source::Iacr,
            "google_scholar" | "scholar" => Source::GoogleScholar,
            "searxng" => Source::Searxng,
            "sci_hub" | "scihub" => Source::SciHub,
            "huggingface" | "hugging_face" | "hf" => Source::Huggingface,
            _ => return Err(UnknownSource(s.to_string())),
        };
        Ok(source)
    }
}

/// The common record every adapter produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub doi: Option<String>,
    pub published_date: Option<NaiveDate>,
    pub pdf_url: Option<String>,
    pub url: Option<String>,
    pub source: Source,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Paper {
    pub fn new(source: Source, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            abstract_text: String::new(),
            authors: Vec::new(),
            doi: None,
            published_date: None,
            pdf_url: None,
            url: None,
            source,
            extra: Map::new(),
        }
    }

    /// Store key: `source:id`.
    pub fn key(&self) -> String {
        paper_key(self.source, &self.id)
    }

    /// DOI match when both carry one, otherwise the `(source, id)` pair.
    pub fn same_paper(&self, other: &Paper) -> bool {
        match (&self.doi, &other.doi) {
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => true,
            _ => self.source == other.source && self.id == other.id,
        }
    }

    /// Insert a source-specific field, skipping nulls and empty strings/lists.
    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        let empty = match &value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            _ => false,
        };
        if !empty {
            self.extra.insert(key.to_string(), value);
        }
        self
    }
}

pub fn paper_key(source: Source, id: &str) -> String {
    format!("{}:{}", source, id)
}

/// Which operations a source supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub search: bool,
    pub download: bool,
    pub read: bool,
}

impl Capabilities {
    pub const SEARCH_ONLY: Self = Self { search: true, download: false, read: false };
    pub const FULL_TEXT: Self = Self { search: true, download: true, read: true };
}

/// Optional, platform-specific search filters. Sources ignore what they don't understand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SearchFilters {
    /// Year or year range, e.g. "2019", "2016-2020", "2010-", "-2015".
    pub year: Option<String>,
    /// Look-back window in days (bioRxiv / medRxiv).
    pub days: Option<u32>,
    /// CrossRef filter expression, e.g. "from-pub-date:2020,has-full-text:true".
    pub filter: Option<String>,
    /// Sort field (CrossRef).
    pub sort: Option<String>,
    /// Sort order "asc" / "desc" (CrossRef).
    pub order: Option<String>,
    /// Fetch each paper's detail page (IACR).
    pub fetch_details: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: u32,
    pub filters: SearchFilters,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, max_results: u32) -> Self {
        Self { query: query.into(), max_results, filters: SearchFilters::default() }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability interface implemented once per platform.
#[async_trait]
pub trait PaperSource: Send + Sync {
    fn source(&self) -> Source;

    fn capabilities(&self) -> Capabilities {
        Capabilities::SEARCH_ONLY
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError>;

    /// The platform's canonical form of a trimmed `id`. Download URLs and cached
    /// file names are both derived from it.
    fn canonical_id<'a>(&self, id: &'a str) -> &'a str {
        id
    }

    /// Save the paper's PDF under `dest_dir` and return its path.
    async fn download(&self, id: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let _ = (id, dest_dir);
        Err(SourceError::Unsupported(format!(
            "{} does not provide PDF downloads",
            self.source()
        )))
    }

    /// Extract the paper's text, reusing a previously downloaded PDF when present.
    async fn read(&self, id: &str, dest_dir: &Path) -> Result<String, SourceError> {
        if !self.capabilities().read {
            return Err(SourceError::Unsupported(format!(
                "{} does not provide full text",
                self.source()
            )));
        }
        let id = self.canonical_id(require_id(id)?);
        let cached = dest_dir.join(pdf_file_name(id));
        let path = if tokio::fs::try_exists(&cached).await.unwrap_or(false) {
            cached
        } else {
            self.download(id, dest_dir).await?
        };
        crate::documents::extract_text_async(path)
            .await
            .map_err(|e| SourceError::Parse(format!("{:#}", e)))
    }
}

/// Build the shared HTTP client. Every request made through it carries `timeout`.
pub fn build_client(
    timeout: Duration,
    user_agent: &str,
    proxy: Option<&str>,
) -> Result<reqwest::Client, SourceError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10));
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    Ok(builder.build()?)
}

/// One page of platform results.
///
/// `raw` is the number of records the platform returned, counted before malformed
/// ones were dropped, so it tracks the platform's own offset.
#[derive(Debug, Default)]
pub struct Page {
    pub raw: u32,
    pub papers: Vec<Paper>,
}

impl Page {
    pub fn new(raw: usize, papers: Vec<Paper>) -> Self {
        Self { raw: u32::try_from(raw).unwrap_or(u32::MAX), papers }
    }
}

/// Page through a source until `max_results` records are collected or a short page arrives.
///
/// `fetch_page(offset, count)` returns one page. A page is short when the platform
/// returned fewer raw records than asked for; records dropped while parsing do not
/// end pagination. A failure after the first page keeps what was already collected.
pub(crate) async fn collect_pages<F, Fut>(
    max_results: u32,
    page_size: u32,
    pause: Duration,
    mut fetch_page: F,
) -> Result<Vec<Paper>, SourceError>
where
    F: FnMut(u32, u32) -> Fut,
    Fut: Future<Output = Result<Page, SourceError>>,
{
    let mut papers: Vec<Paper> = Vec::new();
    let mut offset = 0u32;
    while (papers.len() as u32) < max_results {
        if offset > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let want = (max_results - papers.len() as u32).min(page_size);
        let page = match fetch_page(offset, want).await {
            Ok(page) => page,
            Err(e) if !papers.is_empty() => {
                tracing::warn!("Stopping pagination at offset {}: {}", offset, e);
                break;
            }
            Err(e) => return Err(e),
        };
        let dropped = page.raw.saturating_sub(page.papers.len() as u32);
        if dropped > 0 {
            tracing::debug!(offset, dropped, "Skipped malformed records");
        }
        papers.extend(page.papers);
        if page.raw < want {
            break;
        }
        offset += page.raw;
    }
    papers.truncate(max_results as usize);
    Ok(papers)
}

/// Fetch a URL that must answer with a PDF body.
pub(crate) async fn fetch_pdf_bytes(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<u8>, SourceError> {
    tracing::debug!(url, "Downloading PDF");
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SourceError::Api(format!("PDF request to {} returned {}", url, status)));
    }
    let pdf_content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/pdf"));
    let bytes = resp.bytes().await?;
    if !pdf_content_type && !bytes.starts_with(b"%PDF") {
        return Err(SourceError::Parse(format!("{} did not return a PDF", url)));
    }
    Ok(bytes.to_vec())
}

/// Write `bytes` to `dest_dir/file_name`, creating the directory and overwriting any existing file.
pub(crate) async fn save_pdf(
    dest_dir: &Path,
    file_name: &str,
    bytes: &[u8],
) -> Result<PathBuf, SourceError> {
    tokio::fs::create_dir_all(dest_dir).await?;
    let path = dest_dir.join(file_name);
    tokio::fs::write(&path, bytes).await?;
    tracing::info!("Saved PDF to {}", path.display());
    Ok(path)
}

pub(crate) async fn fetch_pdf(
    client: &reqwest::Client,
    url: &str,
    dest_dir: &Path,
    id: &str,
) -> Result<PathBuf, SourceError> {
    let bytes = fetch_pdf_bytes(client, url).await?;
    save_pdf(dest_dir, &pdf_file_name(id), &bytes).await
}

/// `2106.12345` -> `2106.12345.pdf`, `2009/101` -> `2009_101.pdf`.
pub fn pdf_file_name(id: &str) -> String {
    format!("{}.pdf", sanitize_id(id))
}

pub fn sanitize_id(id: &str) -> String {
    id.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse the leading `YYYY-MM-DD` of a timestamp.
pub(crate) fn parse_date_prefix(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()
}

/// `arxiv:2106.09685` and `arXiv:2106.09685` -> `2106.09685`.
pub(crate) fn strip_arxiv_prefix(id: &str) -> &str {
    match id.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("arxiv:") => id[6..].trim_start(),
        _ => id,
    }
}

pub(crate) fn require_id(id: &str) -> Result<&str, SourceError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(SourceError::InvalidInput("paper id must not be empty".into()));
    }
    Ok(id)
}
