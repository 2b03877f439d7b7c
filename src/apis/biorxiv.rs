use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    collect_pages, fetch_pdf, parse_date_prefix, require_id, Capabilities, Page, Paper, PaperSource,
    SearchRequest, Source, SourceError,
};
use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

const API_URL: &str = "https://api.biorxiv.org";

/// The details endpoint always answers with pages of 100.
const PAGE_SIZE: u32 = 100;
const DEFAULT_DAYS: u32 = 30;

/// The two preprint servers behind api.biorxiv.org.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprintServer {
    Biorxiv,
    Medrxiv,
}

impl PreprintServer {
    fn name(self) -> &'static str {
        match self {
            PreprintServer::Biorxiv => "biorxiv",
            PreprintServer::Medrxiv => "medrxiv",
        }
    }

    fn source(self) -> Source {
        match self {
            PreprintServer::Biorxiv => Source::Biorxiv,
            PreprintServer::Medrxiv => Source::Medrxiv,
        }
    }
}

pub struct RxivClient {
    client: reqwest::Client,
    server: PreprintServer,
    api_url: String,
    site_url: String,
}

impl RxivClient {
    pub fn new(client: reqwest::Client, server: PreprintServer) -> Self {
        Self {
            client,
            server,
            api_url: API_URL.to_string(),
            site_url: format!("https://www.{}.org", server.name()),
        }
    }

    pub fn with_base_urls(mut self, api_url: &str, site_url: &str) -> Self {
        self.api_url = api_url.trim_end_matches('/').to_string();
        self.site_url = site_url.trim_end_matches('/').to_string();
        self
    }

    async fn fetch_page(
        &self,
        category: &str,
        window: (NaiveDate, NaiveDate),
        cursor: u32,
        count: u32,
    ) -> Result<Page, SourceError> {
        let url = format!(
            "{}/details/{}/{}/{}/{}",
            self.api_url,
            self.server.name(),
            window.0.format("%Y-%m-%d"),
            window.1.format("%Y-%m-%d"),
            cursor
        );
        tracing::debug!(%url, category, "Querying {}", self.server.name());
        let mut req = self.client.get(&url);
        if !category.is_empty() {
            req = req.query(&[("category", category)]);
        }
        let resp: DetailsResponse = req.send().await?.error_for_status()?.json().await?;
        let items: Vec<RxivItem> = resp.collection.into_iter().take(count as usize).collect();
        let raw = items.len();
        Ok(Page::new(raw, items.into_iter().filter_map(|item| self.to_paper(item)).collect()))
    }

    fn to_paper(&self, item: RxivItem) -> Option<Paper> {
        let doi = item.doi.trim().to_string();
        let title = super::collapse_whitespace(&item.title);
        if doi.is_empty() || title.is_empty() {
            return None;
        }
        let version = item.version_string();
        let mut paper = Paper::new(self.server.source(), doi.clone(), title);
        paper.abstract_text = super::collapse_whitespace(&item.abstract_text);
        paper.authors = item
            .authors
            .split(';')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
        paper.published_date = parse_date_prefix(&item.date);
        paper.url = Some(format!("{}/content/{}v{}", self.site_url, doi, version));
        paper.pdf_url = Some(self.pdf_url(&doi, &version));
        paper.doi = Some(doi);
        Some(
            paper
                .with_extra("category", item.category)
                .with_extra("version", version)
                .with_extra("published", item.published.filter(|p| p != "NA")),
        )
    }

    fn pdf_url(&self, doi: &str, version: &str) -> String {
        format!("{}/content/{}v{}.full.pdf", self.site_url, doi, version)
    }

    /// Newest posted version of a DOI, if the server knows it.
    async fn latest_version(&self, doi: &str) -> Result<Option<String>, SourceError> {
        let url = format!("{}/details/{}/{}", self.api_url, self.server.name(), doi);
        let resp: DetailsResponse = self.client.get(&url).send().await?.error_for_status()?.json().await?;
        Ok(resp.collection.last().map(RxivItem::version_string))
    }
}

/// `cell biology` -> `cell_biology`, the form the category filter expects.
fn category_filter(query: &str) -> String {
    query.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join("_")
}

fn date_window(days: u32) -> (NaiveDate, NaiveDate) {
    let end = Utc::now().date_naive();
    let start = end.checked_sub_days(Days::new(days as u64)).unwrap_or(end);
    (start, end)
}

#[derive(Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    collection: Vec<RxivItem>,
}

#[derive(Deserialize)]
struct RxivItem {
    #[serde(default)]
    doi: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    authors: String,
    #[serde(default)]
    date: String,
    #[serde(default)]
    version: Value,
    #[serde(default)]
    category: String,
    #[serde(rename = "abstract", default)]
    abstract_text: String,
    published: Option<String>,
}

impl RxivItem {
    fn version_string(&self) -> String {
        match &self.version {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => "1".to_string(),
        }
    }
}

#[async_trait]
impl PaperSource for RxivClient {
    fn source(&self) -> Source {
        self.server.source()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL_TEXT
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        let category = category_filter(&request.query);
        let window = date_window(request.filters.days.unwrap_or(DEFAULT_DAYS));
        collect_pages(request.max_results, PAGE_SIZE, Duration::from_millis(500), |cursor, count| {
            self.fetch_page(&category, window, cursor, count)
        })
        .await
    }

    async fn download(&self, id: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let doi = require_id(id)?;
        let version = match self.latest_version(doi).await {
            Ok(Some(v)) => v,
            Ok(None) => "1".to_string(),
            Err(e) => {
                tracing::warn!("Could not look up version of {}: {}", doi, e);
                "1".to_string()
            }
        };
        fetch_pdf(&self.client, &self.pdf_url(doi, &version), dest_dir, doi).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(n: u32) -> Value {
        json!({
            "doi": format!("10.1101/2024.01.{:02}.000001", n),
            "title": format!("Preprint {}", n),
            "authors": "Smith, J.; Doe, A.",
            "date": "2024-01-15",
            "version": "2",
            "category": "neuroscience",
            "abstract": "An  abstract.",
            "published": "NA",
            "server": "biorxiv"
        })
    }

    #[test]
    fn test_category_filter() {
        assert_eq!(category_filter("Cell Biology"), "cell_biology");
        assert_eq!(category_filter("  neuroscience "), "neuroscience");
    }

    #[test]
    fn test_item_to_paper() {
        let client = RxivClient::new(reqwest::Client::new(), PreprintServer::Medrxiv);
        let raw: RxivItem = serde_json::from_value(item(3)).unwrap();
        let paper = client.to_paper(raw).unwrap();
        assert_eq!(paper.source, Source::Medrxiv);
        assert_eq!(paper.id, "10.1101/2024.01.03.000001");
        assert_eq!(paper.authors, vec!["Smith, J.", "Doe, A."]);
        assert_eq!(paper.abstract_text, "An abstract.");
        assert_eq!(paper.published_date, NaiveDate::from_ymd_opt(2024, 1, 15));
        assert_eq!(
            paper.pdf_url.as_deref(),
            Some("https://www.medrxiv.org/content/10.1101/2024.01.03.000001v2.full.pdf")
        );
        assert!(paper.extra.get("published").is_none());
    }

    #[tokio::test]
    async fn test_search_walks_cursor_pages() {
        let server = MockServer::start().await;
        let first: Vec<Value> = (0..100).map(|n| item(n % 28 + 1)).collect();
        Mock::given(method("GET"))
            .and(path_regex(r"^/details/biorxiv/\d{4}-\d{2}-\d{2}/\d{4}-\d{2}-\d{2}/0$"))
            .and(query_param("category", "neuroscience"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"status": "ok", "cursor": 0, "count": 100}],
                "collection": first
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/details/biorxiv/.+/100$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"status": "ok", "cursor": 100, "count": 2}],
                "collection": [item(1), item(2)]
            })))
            .mount(&server)
            .await;

        let client = RxivClient::new(reqwest::Client::new(), PreprintServer::Biorxiv)
            .with_base_urls(&server.uri(), &server.uri());
        let papers = client.search(&SearchRequest::new("Neuroscience", 150)).await.unwrap();
        assert_eq!(papers.len(), 102);
        assert!(papers.iter().all(|p| p.source == Source::Biorxiv));
    }

    #[tokio::test]
    async fn test_download_uses_latest_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/details/biorxiv/10.1101/2024.01.05.000001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "collection": [
                    {"doi": "10.1101/2024.01.05.000001", "title": "T", "version": "1"},
                    {"doi": "10.1101/2024.01.05.000001", "title": "T", "version": "3"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/content/10.1101/2024.01.05.000001v3.full.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 test".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let client = RxivClient::new(reqwest::Client::new(), PreprintServer::Biorxiv)
            .with_base_urls(&server.uri(), &server.uri());
        let saved = client.download("10.1101/2024.01.05.000001", dir.path()).await.unwrap();
        assert_eq!(saved, dir.path().join("10.1101_2024.01.05.000001.pdf"));
        assert!(std::fs::read(&saved).unwrap().starts_with(b"%PDF"));
    }
}
