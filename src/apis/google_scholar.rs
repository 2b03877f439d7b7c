use std::time::Duration;

use super::{collect_pages, Page, Paper, PaperSource, SearchRequest, Source, SourceError, BROWSER_USER_AGENT};
use async_trait::async_trait;
use chrono::NaiveDate;
use rand::Rng;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

pub const DEFAULT_SCHOLAR_URL: &str = "https://scholar.google.com";

/// Scholar serves ten hits per page.
const PAGE_SIZE: u32 = 10;

pub struct GoogleScholarClient {
    client: reqwest::Client,
    base_url: String,
    randomize_delay: bool,
}

impl GoogleScholarClient {
    /// `client` should already carry the configured proxy, if any.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, base_url: DEFAULT_SCHOLAR_URL.to_string(), randomize_delay: true }
    }

    /// Point at a mirror. Mirrors are not rate limited, so the random delay is skipped.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self.randomize_delay = false;
        self
    }

    async fn fetch_page(&self, query: &str, ylo: Option<i32>, start: u32) -> Result<Page, SourceError> {
        if start > 0 && self.randomize_delay {
            let delay = rand::thread_rng().gen_range(500..2000);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let url = build_search_url(&self.base_url, query, start, ylo)?;
        tracing::debug!(url = %url, "Fetching Google Scholar page");

        let resp = self
            .client
            .get(url.as_str())
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::Api("Google Scholar rate limit exceeded (HTTP 429)".into()));
        }
        if !status.is_success() {
            return Err(SourceError::Api(format!("Google Scholar returned {}", status)));
        }
        let html = resp.text().await?;
        if html.contains("Solving the above CAPTCHA") || html.contains("unusual traffic") {
            tracing::warn!("Google Scholar CAPTCHA detected");
            return Err(SourceError::Api("Google Scholar is asking for a CAPTCHA".into()));
        }
        parse_result_items(&html)
    }
}

fn build_search_url(base_url: &str, query: &str, start: u32, ylo: Option<i32>) -> Result<Url, SourceError> {
    let mut url = Url::parse(&format!("{}/scholar", base_url))
        .map_err(|e| SourceError::InvalidInput(format!("Invalid base URL: {}", e)))?;
    {
        let mut params = url.query_pairs_mut();
        params.append_pair("q", query);
        params.append_pair("hl", "en");
        params.append_pair("start", &start.to_string());
        params.append_pair("as_sdt", "0,5");
        if let Some(year) = ylo {
            params.append_pair("as_ylo", &year.to_string());
        }
    }
    Ok(url)
}

/// Lower bound of a year filter: `2019`, `2016-2020` and `2010-` all yield a year.
fn year_lower_bound(year: Option<&str>) -> Option<i32> {
    let year = year?.trim();
    year.split('-').next()?.trim().parse().ok()
}

fn parse_err<E: std::fmt::Debug>(e: E) -> SourceError {
    SourceError::Parse(format!("{:?}", e))
}

/// Extract the result blocks of a Scholar results page. `raw` counts every block, including untitled ones.
pub fn parse_result_items(html: &str) -> Result<Page, SourceError> {
    let document = Html::parse_document(html);

    let item_selector = Selector::parse("div.gs_r.gs_or.gs_scl").map_err(parse_err)?;
    let title_selector = Selector::parse("h3.gs_rt").map_err(parse_err)?;
    let link_selector = Selector::parse("h3.gs_rt a").map_err(parse_err)?;
    let meta_selector = Selector::parse("div.gs_a").map_err(parse_err)?;
    let snippet_selector = Selector::parse("div.gs_rs").map_err(parse_err)?;
    let cite_selector = Selector::parse("div.gs_fl a").map_err(parse_err)?;
    let side_link_selector = Selector::parse("div.gs_ggs a, div.gs_or_ggsm a").map_err(parse_err)?;

    let year_regex = Regex::new(r"\b(19|20)\d{2}\b").map_err(parse_err)?;
    let cite_regex = Regex::new(r"Cited by\s*(\d+)").map_err(parse_err)?;
    let tag_regex = Regex::new(r"^(\[[A-Z]+\]\s*)+").map_err(parse_err)?;

    let mut results = Vec::new();
    let mut blocks = 0usize;

    for item in document.select(&item_selector) {
        blocks += 1;
        let (title, article_url) = match item.select(&link_selector).next() {
            Some(link) => (
                link.text().collect::<String>(),
                link.value().attr("href").map(String::from),
            ),
            None => match item.select(&title_selector).next() {
                Some(title_elem) => (title_elem.text().collect::<String>(), None),
                None => continue,
            },
        };
        let title = super::collapse_whitespace(&tag_regex.replace(title.trim(), ""));
        if title.is_empty() {
            continue;
        }
        let id = article_url
            .clone()
            .or_else(|| item.value().attr("data-cid").map(String::from))
            .unwrap_or_else(|| title.clone());

        let mut paper = Paper::new(Source::GoogleScholar, id, title);
        paper.url = article_url;

        let mut venue = String::new();
        if let Some(meta_elem) = item.select(&meta_selector).next() {
            let meta_text = meta_elem.text().collect::<String>();
            let parts: Vec<&str> = meta_text.split(" - ").collect();
            if let Some(authors) = parts.first() {
                paper.authors = authors
                    .split(',')
                    .map(|a| a.trim().trim_end_matches('…').trim())
                    .filter(|a| !a.is_empty())
                    .map(String::from)
                    .collect();
            }
            if let Some(venue_year) = parts.get(1) {
                match year_regex.find(venue_year) {
                    Some(m) => {
                        paper.published_date = m.as_str().parse().ok().and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1));
                        venue = venue_year[..m.start()].trim().trim_end_matches(',').to_string();
                    }
                    None => venue = venue_year.trim().to_string(),
                }
            }
        }

        if let Some(snippet_elem) = item.select(&snippet_selector).next() {
            paper.abstract_text = super::collapse_whitespace(&snippet_elem.text().collect::<String>());
        }

        let mut citations: Option<u64> = None;
        for link in item.select(&cite_selector) {
            let href = link.value().attr("href").unwrap_or("");
            if !href.contains("cites=") {
                continue;
            }
            let text = link.text().collect::<String>();
            if let Some(count) = cite_regex.captures(&text).and_then(|c| c.get(1)) {
                citations = count.as_str().parse().ok();
                break;
            }
        }

        paper.pdf_url = item
            .select(&side_link_selector)
            .find(|a| a.text().collect::<String>().contains("[PDF]"))
            .and_then(|a| a.value().attr("href").map(String::from));

        results.push(paper.with_extra("venue", venue).with_extra("citations", citations));
    }

    Ok(Page::new(blocks, results))
}

#[async_trait]
impl PaperSource for GoogleScholarClient {
    fn source(&self) -> Source {
        Source::GoogleScholar
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        tracing::info!(query = %request.query, "Starting Google Scholar query");
        let ylo = year_lower_bound(request.filters.year.as_deref());
        collect_pages(request.max_results, PAGE_SIZE, Duration::ZERO, |start, _count| {
            self.fetch_page(&request.query, ylo, start)
        })
        .await
    }
}
