use std::path::{Path, PathBuf};

use super::{
    fetch_pdf, parse_date_prefix, require_id, strip_arxiv_prefix, Capabilities, Paper, PaperSource,
    SearchRequest, Source, SourceError,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

const API_URL: &str = "https://huggingface.co/api";
const MAX_PAGE: u32 = 100;

/// Papers indexed on the Hugging Face Hub. Every paper there is an arXiv id.
pub struct HuggingFaceClient {
    client: reqwest::Client,
    api_url: String,
    pdf_base_url: String,
    token: Option<String>,
}

impl HuggingFaceClient {
    pub fn new(client: reqwest::Client, token: Option<String>) -> Self {
        Self {
            client,
            api_url: API_URL.to_string(),
            pdf_base_url: "https://arxiv.org/pdf".to_string(),
            token,
        }
    }

    pub fn with_base_urls(mut self, api_url: &str, pdf_base_url: &str) -> Self {
        self.api_url = api_url.trim_end_matches('/').to_string();
        self.pdf_base_url = pdf_base_url.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct HfPaper {
    id: String,
    title: String,
    summary: String,
    authors: Vec<HfAuthor>,
    published_at: Option<String>,
    upvotes: Option<i64>,
    #[serde(rename = "ai_keywords")]
    ai_keywords: Vec<String>,
    github_repo: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct HfAuthor {
    name: String,
}

/// Search hits wrap the paper in `{"paper": {...}}`; older responses are flat.
fn entry_to_paper(entry: Value) -> Option<Paper> {
    let raw = match entry.get("paper").filter(|p| p.is_object()).cloned() {
        Some(inner) => inner,
        None => entry,
    };
    let hf: HfPaper = serde_json::from_value(raw).ok()?;
    let id = hf.id.trim().to_string();
    let title = super::collapse_whitespace(&hf.title);
    if id.is_empty() || title.is_empty() {
        return None;
    }
    let mut paper = Paper::new(Source::Huggingface, id.clone(), title);
    paper.abstract_text = super::collapse_whitespace(&hf.summary);
    paper.authors = hf.authors.into_iter().map(|a| a.name).filter(|n| !n.is_empty()).collect();
    paper.published_date = hf.published_at.as_deref().and_then(parse_date_prefix);
    paper.url = Some(format!("https://huggingface.co/papers/{}", id));
    paper.pdf_url = Some(format!("https://arxiv.org/pdf/{}", id));
    paper.doi = Some(format!("10.48550/arXiv.{}", id));
    Some(
        paper
            .with_extra("arxiv_id", id)
            .with_extra("upvotes", hf.upvotes)
            .with_extra("keywords", hf.ai_keywords)
            .with_extra("github_repo", hf.github_repo),
    )
}

#[async_trait]
impl PaperSource for HuggingFaceClient {
    fn source(&self) -> Source {
        Source::Huggingface
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL_TEXT
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        if request.max_results > MAX_PAGE {
            tracing::warn!(
                "Hugging Face returns at most {} papers per search; {} requested",
                MAX_PAGE,
                request.max_results
            );
        }
        let limit = request.max_results.min(MAX_PAGE).to_string();
        let url = format!("{}/papers/search", self.api_url);
        let mut req = self
            .client
            .get(&url)
            .query(&[("q", request.query.as_str()), ("limit", limit.as_str())]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let entries: Vec<Value> = req.send().await?.error_for_status()?.json().await?;
        let mut papers: Vec<Paper> = entries.into_iter().filter_map(entry_to_paper).collect();
        papers.truncate(request.max_results.min(MAX_PAGE) as usize);
        Ok(papers)
    }

    /// Hugging Face papers are keyed by arXiv id.
    fn canonical_id<'a>(&self, id: &'a str) -> &'a str {
        strip_arxiv_prefix(id)
    }

    async fn download(&self, id: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let id = self.canonical_id(require_id(id)?);
        let url = format!("{}/{}", self.pdf_base_url, id);
        fetch_pdf(&self.client, &url, dest_dir, id).await
    }
}
