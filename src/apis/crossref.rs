use std::path::{Path, PathBuf};

use super::{collect_pages, Page, Paper, PaperSource, SearchRequest, Source, SourceError};
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;

const BASE_URL: &str = "https://api.crossref.org";
const PAGE_SIZE: u32 = 1000;

pub struct CrossRefClient {
    client: reqwest::Client,
    base_url: String,
    mailto: String,
}

impl CrossRefClient {
    pub fn new(client: reqwest::Client, mailto: impl Into<String>) -> Self {
        Self { client, base_url: BASE_URL.to_string(), mailto: mailto.into() }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn fetch_page(
        &self,
        request: &SearchRequest,
        offset: u32,
        rows: u32,
    ) -> Result<Page, SourceError> {
        let filters = &request.filters;
        let mut params = vec![
            ("query", request.query.clone()),
            ("rows", rows.to_string()),
            ("sort", filters.sort.clone().unwrap_or_else(|| "relevance".into())),
            ("order", filters.order.clone().unwrap_or_else(|| "desc".into())),
            ("mailto", self.mailto.clone()),
        ];
        if offset > 0 {
            params.push(("offset", offset.to_string()));
        }
        if let Some(filter) = filters.filter.as_ref().filter(|f| !f.trim().is_empty()) {
            params.push(("filter", filter.clone()));
        }
        let url = format!("{}/works", self.base_url);
        let resp = self.client.get(&url).query(&params).send().await?;
        if resp.status().as_u16() == 429 {
            return Err(SourceError::Api("CrossRef rate limit exceeded (HTTP 429)".into()));
        }
        let resp: CRListResponse = resp.error_for_status()?.json().await?;
        let raw = resp.message.items.len();
        Ok(Page::new(raw, resp.message.items.into_iter().filter_map(item_to_paper).collect()))
    }

    /// Look up a single work. `Ok(None)` when CrossRef does not know the DOI.
    pub async fn get_paper_by_doi(&self, doi: &str) -> Result<Option<Paper>, SourceError> {
        let doi = super::require_id(doi)?;
        let url = format!("{}/works/{}", self.base_url, doi);
        let resp = self
            .client
            .get(&url)
            .query(&[("mailto", self.mailto.as_str())])
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            tracing::warn!("DOI not found in CrossRef: {}", doi);
            return Ok(None);
        }
        let resp: CRWorkResponse = resp.error_for_status()?.json().await?;
        Ok(item_to_paper(resp.message))
    }
}

#[derive(Deserialize)]
struct CRListResponse {
    message: CRList,
}

#[derive(Deserialize)]
struct CRList {
    #[serde(default)]
    items: Vec<CRItem>,
}

#[derive(Deserialize)]
struct CRWorkResponse {
    message: CRItem,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CRItem {
    #[serde(rename = "DOI")]
    doi: String,
    #[serde(rename = "URL")]
    url: Option<String>,
    title: Vec<String>,
    author: Vec<CRAuthor>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    published: Option<CRDate>,
    issued: Option<CRDate>,
    created: Option<CRDate>,
    resource: Option<CRResource>,
    link: Vec<CRLink>,
    publisher: Option<String>,
    #[serde(rename = "container-title")]
    container_title: Vec<String>,
    volume: Option<String>,
    issue: Option<String>,
    page: Option<String>,
    #[serde(rename = "ISSN")]
    issn: Vec<String>,
    #[serde(rename = "ISBN")]
    isbn: Vec<String>,
    #[serde(rename = "type")]
    work_type: Option<String>,
    member: Option<String>,
    prefix: Option<String>,
    subject: Vec<String>,
    #[serde(rename = "is-referenced-by-count")]
    citation_count: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CRAuthor {
    given: Option<String>,
    family: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct CRDate {
    #[serde(rename = "date-parts", default)]
    date_parts: Vec<Vec<Option<i64>>>,
}

#[derive(Deserialize)]
struct CRResource {
    primary: Option<CRLink>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CRLink {
    #[serde(rename = "URL")]
    url: Option<String>,
    #[serde(rename = "content-type")]
    content_type: Option<String>,
}

impl CRDate {
    fn to_date(&self) -> Option<NaiveDate> {
        let parts = self.date_parts.first()?;
        let year = (*parts.first()?)? as i32;
        let month = parts.get(1).copied().flatten().unwrap_or(1) as u32;
        let day = parts.get(2).copied().flatten().unwrap_or(1) as u32;
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

fn author_name(author: &CRAuthor) -> Option<String> {
    let given = author.given.as_deref().unwrap_or("").trim();
    let family = author.family.as_deref().unwrap_or("").trim();
    let name = match (given.is_empty(), family.is_empty()) {
        (false, false) => format!("{} {}", given, family),
        (true, false) => family.to_string(),
        (false, true) => given.to_string(),
        (true, true) => author.name.clone().unwrap_or_default(),
    };
    (!name.is_empty()).then_some(name)
}

static JATS_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?jats:[^>]*>").expect("valid regex"));

/// CrossRef abstracts are JATS fragments: `<jats:p>...</jats:p>`.
fn strip_jats(text: &str) -> String {
    JATS_TAG_RE.replace_all(text, " ").into_owned()
}

fn pdf_link(item: &CRItem) -> Option<String> {
    let primary = item
        .resource
        .as_ref()
        .and_then(|r| r.primary.as_ref())
        .and_then(|p| p.url.clone())
        .filter(|u| u.to_lowercase().ends_with(".pdf"));
    primary.or_else(|| {
        item.link
            .iter()
            .find(|l| l.content_type.as_deref().is_some_and(|c| c.to_lowercase().contains("pdf")))
            .and_then(|l| l.url.clone())
    })
}

fn item_to_paper(item: CRItem) -> Option<Paper> {
    let doi = item.doi.trim().to_string();
    let title = super::collapse_whitespace(item.title.first().map(String::as_str).unwrap_or(""));
    if doi.is_empty() || title.is_empty() {
        return None;
    }
    let published_date = [&item.published, &item.issued, &item.created]
        .into_iter()
        .flatten()
        .find_map(CRDate::to_date);
    let pdf_url = pdf_link(&item);

    let mut paper = Paper::new(Source::Crossref, doi.clone(), title);
    paper.abstract_text = item
        .abstract_text
        .as_deref()
        .map(|a| super::collapse_whitespace(&strip_jats(a)))
        .unwrap_or_default();
    paper.authors = item.author.iter().filter_map(author_name).collect();
    paper.published_date = published_date;
    paper.url = item.url.clone().or_else(|| Some(format!("https://doi.org/{}", doi)));
    paper.pdf_url = pdf_url;
    paper.doi = Some(doi);
    Some(
        paper
            .with_extra("publisher", item.publisher)
            .with_extra("container_title", item.container_title.into_iter().next())
            .with_extra("volume", item.volume)
            .with_extra("issue", item.issue)
            .with_extra("page", item.page)
            .with_extra("issn", item.issn)
            .with_extra("isbn", item.isbn)
            .with_extra("crossref_type", item.work_type)
            .with_extra("member", item.member)
            .with_extra("prefix", item.prefix)
            .with_extra("subjects", item.subject)
            .with_extra("citations", item.citation_count),
    )
}

#[async_trait]
impl PaperSource for CrossRefClient {
    fn source(&self) -> Source {
        Source::Crossref
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        collect_pages(request.max_results, PAGE_SIZE, Duration::from_millis(500), |offset, rows| {
            self.fetch_page(request, offset, rows)
        })
        .await
    }

    async fn download(&self, _id: &str, _dest_dir: &Path) -> Result<PathBuf, SourceError> {
        Err(SourceError::Unsupported(
            "CrossRef does not provide direct PDF downloads. CrossRef is a citation database \
             that provides metadata about academic papers. To access the full text, please use \
             the paper's DOI or URL to visit the publisher's website."
                .into(),
        ))
    }

    async fn read(&self, _id: &str, _dest_dir: &Path) -> Result<String, SourceError> {
        Err(SourceError::Unsupported(
            "CrossRef papers cannot be read directly through this tool. CrossRef is a citation \
             database that provides metadata about academic papers. Only metadata and abstracts \
             are available through CrossRef's API. To access the full text, please use the \
             paper's DOI or URL to visit the publisher's website."
                .into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn work() -> serde_json::Value {
        json!({
            "DOI": "10.1038/nature12373",
            "title": ["Nanometre-scale thermometry in a living cell"],
            "author": [
                {"given": "G.", "family": "Kucsko"},
                {"family": "Maurer"},
                {"name": "The Collaboration"}
            ],
            "abstract": "<jats:p>Sensitive probing of temperature</jats:p>",
            "issued": {"date-parts": [[2013, 7]]},
            "created": {"date-parts": [[2013, 8, 1]]},
            "URL": "http://dx.doi.org/10.1038/nature12373",
            "resource": {"primary": {"URL": "https://www.nature.com/articles/nature12373"}},
            "link": [
                {"URL": "https://www.nature.com/articles/nature12373.xml", "content-type": "text/xml"},
                {"URL": "https://www.nature.com/articles/nature12373.pdf", "content-type": "application/pdf"}
            ],
            "publisher": "Springer Science and Business Media LLC",
            "container-title": ["Nature"],
            "volume": "500",
            "issue": "7460",
            "page": "54-58",
            "ISSN": ["0028-0836", "1476-4687"],
            "type": "journal-article",
            "member": "297",
            "prefix": "10.1038",
            "is-referenced-by-count": 1234
        })
    }

    #[test]
    fn test_item_to_paper() {
        let item: CRItem = serde_json::from_value(work()).unwrap();
        let paper = item_to_paper(item).unwrap();
        assert_eq!(paper.id, "10.1038/nature12373");
        assert_eq!(paper.authors, vec!["G. Kucsko", "Maurer", "The Collaboration"]);
        assert_eq!(paper.abstract_text, "Sensitive probing of temperature");
        // issued is used when published is absent
        assert_eq!(paper.published_date, NaiveDate::from_ymd_opt(2013, 7, 1));
        assert_eq!(paper.pdf_url.as_deref(), Some("https://www.nature.com/articles/nature12373.pdf"));
        assert_eq!(paper.extra["publisher"], "Springer Science and Business Media LLC");
        assert_eq!(paper.extra["container_title"], "Nature");
        assert_eq!(paper.extra["crossref_type"], "journal-article");
        assert_eq!(paper.extra["issn"], json!(["0028-0836", "1476-4687"]));
        assert!(paper.extra.get("isbn").is_none());
    }

    #[test]
    fn test_strip_jats() {
        assert_eq!(
            super::super::collapse_whitespace(&strip_jats(
                "<jats:title>Abstract</jats:title><jats:p>Cold <jats:italic>atoms</jats:italic> trap.</jats:p>"
            )),
            "Abstract Cold atoms trap."
        );
        assert_eq!(strip_jats("no markup"), "no markup");
    }

    #[test]
    fn test_primary_pdf_resource_wins() {
        let mut raw = work();
        raw["resource"]["primary"]["URL"] = json!("https://example.org/paper.PDF");
        let paper = item_to_paper(serde_json::from_value(raw).unwrap()).unwrap();
        assert_eq!(paper.pdf_url.as_deref(), Some("https://example.org/paper.PDF"));
    }

    #[test]
    fn test_item_without_title_is_dropped() {
        let mut raw = work();
        raw["title"] = json!([]);
        assert!(item_to_paper(serde_json::from_value(raw).unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_search_passes_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/works"))
            .and(query_param("query", "thermometry"))
            .and(query_param("rows", "5"))
            .and(query_param("filter", "from-pub-date:2010"))
            .and(query_param("sort", "published"))
            .and(query_param("mailto", "me@example.org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "message": {"items": [work()]}
            })))
            .mount(&server)
            .await;

        let client = CrossRefClient::new(reqwest::Client::new(), "me@example.org").with_base_url(&server.uri());
        let request = SearchRequest::new("thermometry", 5).with_filters(super::super::SearchFilters {
            filter: Some("from-pub-date:2010".into()),
            sort: Some("published".into()),
            ..Default::default()
        });
        let papers = client.search(&request).await.unwrap();
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].source, Source::Crossref);
    }

    #[tokio::test]
    async fn test_get_paper_by_doi() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/works/10.1038/nature12373"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": work()})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/works/10.0000/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = CrossRefClient::new(reqwest::Client::new(), "me@example.org").with_base_url(&server.uri());
        let found = client.get_paper_by_doi("10.1038/nature12373").await.unwrap().unwrap();
        assert_eq!(found.title, "Nanometre-scale thermometry in a living cell");
        assert!(client.get_paper_by_doi("10.0000/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_download_and_read_explain_missing_full_text() {
        let client = CrossRefClient::new(reqwest::Client::new(), "me@example.org");
        let err = client.download("10.1038/nature12373", Path::new("/tmp")).await.unwrap_err();
        assert!(err.to_string().contains("publisher's website"));
        let err = client.read("10.1038/nature12373", Path::new("/tmp")).await.unwrap_err();
        assert!(err.to_string().contains("cannot be read directly"));
    }
}
