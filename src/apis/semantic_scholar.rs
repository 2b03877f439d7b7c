use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    collect_pages, fetch_pdf, parse_date_prefix, require_id, Capabilities, Page, Paper, PaperSource,
    SearchRequest, Source, SourceError,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const PAGE_SIZE: u32 = 100;

const FIELDS: &str = "paperId,title,abstract,year,publicationDate,authors,externalIds,url,\
openAccessPdf,venue,citationCount,fieldsOfStudy";

pub struct SemanticScholarClient {
    client: reqwest::Client,
    base_url: String,
    arxiv_pdf_url: String,
    api_key: Option<String>,
}

impl SemanticScholarClient {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
            arxiv_pdf_url: "https://arxiv.org/pdf".to_string(),
            api_key,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    /// The shared anonymous pool is throttled hard; keyed clients get more room.
    fn page_interval(&self) -> Duration {
        if self.api_key.is_some() {
            Duration::from_millis(100)
        } else {
            Duration::from_secs(1)
        }
    }

    async fn fetch_page(
        &self,
        query: &str,
        year: Option<&str>,
        offset: u32,
        limit: u32,
    ) -> Result<Page, SourceError> {
        let url = format!("{}/paper/search", self.base_url);
        let mut params = vec![
            ("query", query.to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            ("fields", FIELDS.to_string()),
        ];
        if let Some(year) = year.filter(|y| !y.trim().is_empty()) {
            params.push(("year", year.trim().to_string()));
        }
        let resp = self.add_auth(self.client.get(&url).query(&params)).send().await?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(SourceError::Api("Semantic Scholar rate limit exceeded (HTTP 429)".into()));
        }
        let resp: S2SearchResponse = resp.error_for_status()?.json().await?;
        let data = resp.data.unwrap_or_default();
        let raw = data.len();
        Ok(Page::new(raw, data.into_iter().filter_map(s2_to_paper).collect()))
    }
}

#[derive(Deserialize)]
struct S2SearchResponse {
    data: Option<Vec<S2Paper>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    title: Option<String>,
    authors: Option<Vec<S2Author>>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    year: Option<i32>,
    publication_date: Option<String>,
    external_ids: Option<S2ExternalIds>,
    citation_count: Option<u32>,
    venue: Option<String>,
    fields_of_study: Option<Vec<String>>,
    url: Option<String>,
    open_access_pdf: Option<S2Pdf>,
}

#[derive(Deserialize)]
struct S2Author {
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(rename = "ArXiv")]
    arxiv: Option<String>,
}

#[derive(Deserialize)]
struct S2Pdf {
    url: Option<String>,
}

fn s2_to_paper(p: S2Paper) -> Option<Paper> {
    let id = p.paper_id.filter(|id| !id.is_empty())?;
    let title = super::collapse_whitespace(p.title.as_deref().unwrap_or(""));
    if title.is_empty() {
        return None;
    }
    let mut paper = Paper::new(Source::Semantic, id, title);
    paper.abstract_text = p.abstract_text.unwrap_or_default();
    paper.authors = p
        .authors
        .unwrap_or_default()
        .into_iter()
        .filter_map(|a| a.name)
        .collect();
    paper.published_date = p
        .publication_date
        .as_deref()
        .and_then(parse_date_prefix)
        .or_else(|| p.year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)));
    let (doi, arxiv_id) = match p.external_ids {
        Some(ids) => (ids.doi, ids.arxiv),
        None => (None, None),
    };
    paper.doi = doi;
    paper.url = p.url;
    paper.pdf_url = p.open_access_pdf.and_then(|pdf| pdf.url).filter(|u| !u.is_empty());
    Some(
        paper
            .with_extra("venue", p.venue.unwrap_or_default())
            .with_extra("citations", p.citation_count)
            .with_extra("fields_of_study", p.fields_of_study.unwrap_or_default())
            .with_extra("arxiv_id", arxiv_id),
    )
}

#[async_trait]
impl PaperSource for SemanticScholarClient {
    fn source(&self) -> Source {
        Source::Semantic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL_TEXT
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        let year = request.filters.year.as_deref();
        collect_pages(request.max_results, PAGE_SIZE, self.page_interval(), |offset, limit| {
            self.fetch_page(&request.query, year, offset, limit)
        })
        .await
    }

    /// Accepts an S2 paper id or any id form S2 resolves (`DOI:...`, `ARXIV:...`).
    async fn download(&self, id: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let id = require_id(id)?;
        let url = format!("{}/paper/{}", self.base_url, id);
        let resp = self
            .add_auth(self.client.get(&url).query(&[("fields", FIELDS)]))
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Err(SourceError::Api(format!("Semantic Scholar has no paper '{}'", id)));
        }
        let raw: S2Paper = resp.error_for_status()?.json().await?;
        let arxiv_id = raw.external_ids.as_ref().and_then(|e| e.arxiv.clone());
        let pdf_url = raw
            .open_access_pdf
            .and_then(|pdf| pdf.url)
            .filter(|u| !u.is_empty())
            .or_else(|| arxiv_id.map(|a| format!("{}/{}", self.arxiv_pdf_url, a)));
        match pdf_url {
            Some(pdf_url) => fetch_pdf(&self.client, &pdf_url, dest_dir, id).await,
            None => Err(SourceError::Unsupported(format!(
                "Semantic Scholar lists no open access PDF for '{}'",
                id
            ))),
        }
    }
}
