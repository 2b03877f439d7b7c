use std::collections::HashSet;
use std::time::Duration;

use super::{parse_date_prefix, Paper, PaperSource, SearchRequest, Source, SourceError};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_SEARXNG_URL: &str = "http://localhost:8080";

/// Engine pages are walked until the result count is met or a page comes back empty.
const MAX_PAGES: u32 = 10;

pub struct SearxngClient {
    client: reqwest::Client,
    base_url: String,
    category: String,
}

impl SearxngClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            category: "science".to_string(),
        }
    }

    async fn fetch_page(&self, query: &str, pageno: u32) -> Result<Vec<SearxngResult>, SourceError> {
        let url = format!("{}/search", self.base_url);
        let pageno = pageno.to_string();
        let params = [
            ("q", query),
            ("format", "json"),
            ("categories", self.category.as_str()),
            ("pageno", pageno.as_str()),
        ];
        tracing::debug!(%url, ?params, "Querying SearXNG");
        let resp = self
            .client
            .get(&url)
            .query(&params)
            .header("Accept", "application/json")
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() == 403 {
            return Err(SourceError::Api(
                "SearXNG refused the request; enable the json output format in settings.yml".into(),
            ));
        }
        if !status.is_success() {
            return Err(SourceError::Api(format!("SearXNG returned {}", status)));
        }
        let body: SearxngResponse = resp.json().await?;
        Ok(body.results)
    }
}

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngResult>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    engine: String,
    #[serde(default)]
    engines: Vec<String>,
    #[serde(rename = "publishedDate")]
    published_date: Option<String>,
    doi: Option<String>,
    #[serde(default)]
    authors: Value,
    journal: Option<String>,
    pdf_url: Option<String>,
}

fn find_doi(doi_regex: &Regex, text: &str) -> Option<String> {
    doi_regex
        .find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ')', ';']).to_string())
}

fn result_to_paper(doi_regex: &Regex, r: SearxngResult) -> Option<Paper> {
    let title = super::collapse_whitespace(&r.title);
    let url = r.url.trim().to_string();
    if title.is_empty() || url.is_empty() {
        return None;
    }
    let mut paper = Paper::new(Source::Searxng, url.clone(), title);
    paper.abstract_text = super::collapse_whitespace(&r.content);
    paper.authors = match r.authors {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|a| a.as_str().map(|s| s.trim().to_string()))
            .filter(|a| !a.is_empty())
            .collect(),
        Value::String(s) => s.split(',').map(|a| a.trim().to_string()).filter(|a| !a.is_empty()).collect(),
        _ => Vec::new(),
    };
    paper.doi = r.doi.filter(|d| !d.is_empty()).or_else(|| find_doi(doi_regex, &url));
    paper.published_date = r.published_date.as_deref().and_then(parse_date_prefix);
    paper.pdf_url = r.pdf_url.filter(|u| !u.is_empty());
    paper.url = Some(url);
    Some(
        paper
            .with_extra("engine", r.engine)
            .with_extra("engines", r.engines)
            .with_extra("journal", r.journal),
    )
}

#[async_trait]
impl PaperSource for SearxngClient {
    fn source(&self) -> Source {
        Source::Searxng
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        let doi_regex = Regex::new(r"10\.\d{4,9}/[-._;()/:A-Za-z0-9]+")
            .map_err(|e| SourceError::Parse(e.to_string()))?;
        let max = request.max_results as usize;
        let mut seen = HashSet::new();
        let mut papers = Vec::new();

        for pageno in 1..=MAX_PAGES {
            if pageno > 1 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            let page = match self.fetch_page(&request.query, pageno).await {
                Ok(page) => page,
                Err(e) if !papers.is_empty() => {
                    tracing::warn!("Stopping SearXNG paging at page {}: {}", pageno, e);
                    break;
                }
                Err(e) => return Err(e),
            };
            if page.is_empty() {
                break;
            }
            let mut fresh = 0;
            for paper in page.into_iter().filter_map(|r| result_to_paper(&doi_regex, r)) {
                // later engine pages repeat earlier hits
                if seen.insert(paper.id.clone()) {
                    papers.push(paper);
                    fresh += 1;
                }
            }
            if fresh == 0 || papers.len() >= max {
                break;
            }
        }
        papers.truncate(max);
        Ok(papers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hit(n: u32) -> Value {
        json!({
            "title": format!("Result {}", n),
            "url": format!("https://doi.org/10.1000/xyz{}", n),
            "content": "Some  snippet",
            "engine": "crossref",
            "engines": ["crossref", "google scholar"],
            "publishedDate": "2021-05-04T00:00:00",
            "authors": ["Ada Lovelace", "Alan Turing"]
        })
    }

    #[test]
    fn test_result_to_paper() {
        let re = Regex::new(r"10\.\d{4,9}/[-._;()/:A-Za-z0-9]+").unwrap();
        let raw: SearxngResult = serde_json::from_value(hit(7)).unwrap();
        let paper = result_to_paper(&re, raw).unwrap();
        assert_eq!(paper.id, "https://doi.org/10.1000/xyz7");
        assert_eq!(paper.doi.as_deref(), Some("10.1000/xyz7"));
        assert_eq!(paper.abstract_text, "Some snippet");
        assert_eq!(paper.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(paper.extra["engine"], "crossref");
        assert_eq!(paper.published_date.map(|d| d.to_string()).as_deref(), Some("2021-05-04"));
    }

    #[tokio::test]
    async fn test_search_pages_until_max() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("format", "json"))
            .and(query_param("categories", "science"))
            .and(query_param("pageno", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query": "graphs", "results": [hit(1), hit(2), hit(3)]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("pageno", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [hit(3), hit(4), hit(5)]
            })))
            .mount(&server)
            .await;

        let client = SearxngClient::new(reqwest::Client::new(), &server.uri());
        let papers = client.search(&SearchRequest::new("graphs", 4)).await.unwrap();
        let ids: Vec<_> = papers.iter().map(|p| p.id.rsplit('/').next().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["xyz1", "xyz2", "xyz3", "xyz4"]);
    }

    #[tokio::test]
    async fn test_forbidden_json_format() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let client = SearxngClient::new(reqwest::Client::new(), &server.uri());
        let err = client.search(&SearchRequest::new("graphs", 4)).await.unwrap_err();
        assert!(err.to_string().contains("json"));
    }
}
