use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    fetch_pdf, parse_date_prefix, require_id, Capabilities, Paper, PaperSource, SearchRequest,
    Source, SourceError,
};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

const BASE_URL: &str = "https://eprint.iacr.org";

pub struct IacrClient {
    client: reqwest::Client,
    base_url: String,
}

impl IacrClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, base_url: BASE_URL.to_string() }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn get_html(&self, url: &str, query: &[(&str, &str)]) -> Result<String, SourceError> {
        tracing::debug!(url, "Fetching IACR page");
        Ok(self.client.get(url).query(query).send().await?.error_for_status()?.text().await?)
    }

    /// Fill in abstract, authors, date and PDF link from the paper's own page.
    async fn enrich(&self, paper: &mut Paper) -> Result<(), SourceError> {
        let html = self.get_html(&format!("{}/{}", self.base_url, paper.id), &[]).await?;
        apply_detail_page(paper, &html)
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("bad selector '{}': {:?}", css, e)))
}

fn element_text(el: ElementRef<'_>) -> String {
    super::collapse_whitespace(&el.text().collect::<String>())
}

/// Parse the result list of `/search?q=...`.
fn parse_search_page(html: &str, base_url: &str) -> Result<Vec<Paper>, SourceError> {
    let doc = Html::parse_document(html);
    let block_sel = selector("div.mb-4")?;
    let link_sel = selector("a.paperlink")?;
    let title_sel = selector("strong")?;
    let authors_sel = selector(".summaryauthors, div.fst-italic")?;
    let abstract_sel = selector("p.search-abstract")?;
    let updated_sel = selector("small")?;

    let mut papers = Vec::new();
    for block in doc.select(&block_sel) {
        let Some(link) = block.select(&link_sel).next() else { continue };
        let id = link
            .value()
            .attr("href")
            .unwrap_or("")
            .trim_start_matches('/')
            .to_string();
        let title = block.select(&title_sel).next().map(element_text).unwrap_or_default();
        if id.is_empty() || title.is_empty() {
            continue;
        }
        let mut paper = Paper::new(Source::Iacr, id.clone(), title);
        paper.authors = block
            .select(&authors_sel)
            .next()
            .map(element_text)
            .map(|s| split_authors(&s))
            .unwrap_or_default();
        paper.abstract_text = block.select(&abstract_sel).next().map(element_text).unwrap_or_default();
        paper.published_date = block
            .select(&updated_sel)
            .next()
            .map(element_text)
            .and_then(|s| parse_date_prefix(s.rsplit(' ').next().unwrap_or("")));
        paper.url = Some(format!("{}/{}", base_url, id));
        paper.pdf_url = Some(format!("{}/{}.pdf", base_url, id));
        papers.push(paper);
    }
    Ok(papers)
}

fn split_authors(s: &str) -> Vec<String> {
    s.split([',', ';'])
        .flat_map(|part| part.split(" and "))
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}

/// Read the `citation_*` meta tags of a paper page.
fn apply_detail_page(paper: &mut Paper, html: &str) -> Result<(), SourceError> {
    let doc = Html::parse_document(html);
    let meta_sel = selector("meta[name]")?;
    let mut authors = Vec::new();
    let mut keywords = Vec::new();
    for meta in doc.select(&meta_sel) {
        let name = meta.value().attr("name").unwrap_or("");
        let content = super::collapse_whitespace(meta.value().attr("content").unwrap_or(""));
        if content.is_empty() {
            continue;
        }
        match name {
            "citation_title" => paper.title = content,
            "citation_author" => authors.push(content),
            "citation_abstract" | "description" if paper.abstract_text.is_empty() => {
                paper.abstract_text = content
            }
            "citation_publication_date" => {
                if let Some(date) = parse_date_prefix(&content.replace('/', "-")) {
                    paper.published_date = Some(date);
                }
            }
            "citation_pdf_url" => paper.pdf_url = Some(content),
            "citation_keywords" => keywords.extend(content.split(',').map(|k| k.trim().to_string())),
            "citation_doi" => paper.doi = Some(content),
            _ => {}
        }
    }
    if !authors.is_empty() {
        paper.authors = authors;
    }
    if !keywords.is_empty() {
        paper.extra.insert("keywords".into(), keywords.into());
    }
    Ok(())
}

#[async_trait]
impl PaperSource for IacrClient {
    fn source(&self) -> Source {
        Source::Iacr
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL_TEXT
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        let html = self
            .get_html(&format!("{}/search", self.base_url), &[("q", request.query.as_str())])
            .await?;
        let mut papers = parse_search_page(&html, &self.base_url)?;
        if papers.len() > request.max_results as usize {
            tracing::warn!(
                "IACR returned {} results on its single result page; keeping {}",
                papers.len(),
                request.max_results
            );
            papers.truncate(request.max_results as usize);
        }

        if request.filters.fetch_details.unwrap_or(true) {
            for (i, paper) in papers.iter_mut().enumerate() {
                if i > 0 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                if let Err(e) = self.enrich(paper).await {
                    tracing::warn!("Could not fetch IACR details for {}: {}", paper.id, e);
                }
            }
        }
        Ok(papers)
    }

    /// ePrint numbers look like `2023/1234`; `/2023/1234.pdf` is accepted too.
    fn canonical_id<'a>(&self, id: &'a str) -> &'a str {
        id.trim_start_matches('/').trim_end_matches(".pdf")
    }

    async fn download(&self, id: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let id = self.canonical_id(require_id(id)?);
        let url = format!("{}/{}.pdf", self.base_url, id);
        fetch_pdf(&self.client, &url, dest_dir, id).await
    }
}
