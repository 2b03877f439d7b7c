use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    collect_pages, fetch_pdf, parse_date_prefix, require_id, strip_arxiv_prefix, Capabilities, Page,
    Paper, PaperSource, SearchRequest, Source, SourceError,
};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

const API_URL: &str = "https://export.arxiv.org/api/query";
const PDF_BASE_URL: &str = "https://arxiv.org/pdf";

/// arXiv asks for at most one request every three seconds.
const REQUEST_INTERVAL: Duration = Duration::from_secs(3);
const PAGE_SIZE: u32 = 200;

pub struct ArxivClient {
    client: reqwest::Client,
    api_url: String,
    pdf_base_url: String,
}

impl ArxivClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_urls(client, API_URL, PDF_BASE_URL)
    }

    pub fn with_base_urls(client: reqwest::Client, api_url: &str, pdf_base_url: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            pdf_base_url: pdf_base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_page(&self, query: &str, start: u32, count: u32) -> Result<Page, SourceError> {
        // Bare keywords search every field; fielded queries ("ti:...") pass through.
        let search_query = if query.contains(':') {
            query.to_string()
        } else {
            format!("all:{}", query)
        };
        let start = start.to_string();
        let count = count.to_string();
        tracing::debug!(query = %search_query, start = %start, "Querying arXiv");
        let resp = self
            .client
            .get(&self.api_url)
            .query(&[
                ("search_query", search_query.as_str()),
                ("start", start.as_str()),
                ("max_results", count.as_str()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_atom_feed(&resp)
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    fn source(&self) -> Source {
        Source::Arxiv
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL_TEXT
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        collect_pages(request.max_results, PAGE_SIZE, REQUEST_INTERVAL, |start, count| {
            self.fetch_page(&request.query, start, count)
        })
        .await
    }

    fn canonical_id<'a>(&self, id: &'a str) -> &'a str {
        strip_arxiv_prefix(id)
    }

    async fn download(&self, id: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let id = self.canonical_id(require_id(id)?);
        let url = format!("{}/{}", self.pdf_base_url, id);
        fetch_pdf(&self.client, &url, dest_dir, id).await
    }
}

#[derive(Default)]
struct EntryBuilder {
    id_url: String,
    title: String,
    summary: String,
    published: String,
    updated: String,
    authors: Vec<String>,
    categories: Vec<String>,
    comment: String,
    journal_ref: String,
    doi: Option<String>,
    link_abs: String,
    link_pdf: String,
}

impl EntryBuilder {
    fn take_link(&mut self, e: &BytesStart<'_>) {
        let mut href = String::new();
        let mut title_attr = String::new();
        for attr in e.attributes().flatten() {
            let val = String::from_utf8_lossy(&attr.value).to_string();
            match attr.key.as_ref() {
                b"href" => href = val,
                b"title" => title_attr = val,
                _ => {}
            }
        }
        if title_attr == "pdf" {
            self.link_pdf = href;
        } else if self.link_abs.is_empty() && href.contains("/abs/") {
            self.link_abs = href;
        }
    }

    fn take_category(&mut self, e: &BytesStart<'_>) {
        for attr in e.attributes().flatten() {
            if attr.key.as_ref() == b"term" {
                self.categories.push(String::from_utf8_lossy(&attr.value).to_string());
            }
        }
    }

    fn build(self) -> Option<Paper> {
        let id = self
            .id_url
            .split_once("/abs/")
            .map(|(_, id)| id.to_string())
            .unwrap_or_else(|| self.id_url.rsplit('/').next().unwrap_or("").to_string());
        let title = super::collapse_whitespace(&self.title);
        if id.is_empty() || title.is_empty() {
            return None;
        }
        let url = if self.link_abs.is_empty() { self.id_url.clone() } else { self.link_abs };
        let pdf_url = if self.link_pdf.is_empty() {
            format!("{}/{}", PDF_BASE_URL, id)
        } else {
            self.link_pdf
        };
        let mut paper = Paper::new(Source::Arxiv, id, title);
        paper.abstract_text = super::collapse_whitespace(&self.summary);
        paper.authors = self.authors;
        paper.doi = self.doi;
        paper.published_date = parse_date_prefix(&self.published);
        paper.url = Some(url);
        paper.pdf_url = Some(pdf_url);
        Some(
            paper
                .with_extra("categories", self.categories)
                .with_extra("updated", self.updated.trim())
                .with_extra("comment", super::collapse_whitespace(&self.comment))
                .with_extra("journal_ref", super::collapse_whitespace(&self.journal_ref)),
        )
    }
}

fn parse_atom_feed(xml: &str) -> Result<Page, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut entries = 0usize;
    let mut entry: Option<EntryBuilder> = None;
    let mut current_tag = String::new();
    let mut in_author = false;
    let mut author_name = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    entry = Some(EntryBuilder::default());
                } else if let Some(current) = entry.as_mut() {
                    match tag.as_str() {
                        "author" => {
                            in_author = true;
                            author_name.clear();
                        }
                        "link" => current.take_link(&e),
                        "category" => current.take_category(&e),
                        _ => {}
                    }
                    current_tag = tag;
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(current) = entry.as_mut() {
                    match e.name().as_ref() {
                        b"link" => current.take_link(&e),
                        b"category" => current.take_category(&e),
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(current) = entry.as_mut() {
                    let text = e.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "title" => current.title.push_str(&text),
                        "summary" => current.summary.push_str(&text),
                        "id" => current.id_url.push_str(text.trim()),
                        "published" => current.published.push_str(&text),
                        "updated" => current.updated.push_str(&text),
                        "name" if in_author => author_name.push_str(&text),
                        "arxiv:doi" => current.doi = Some(text.trim().to_string()),
                        "arxiv:comment" => current.comment.push_str(&text),
                        "arxiv:journal_ref" => current.journal_ref.push_str(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    entries += 1;
                    if let Some(paper) = entry.take().and_then(EntryBuilder::build) {
                        papers.push(paper);
                    }
                } else if tag == "author" && in_author {
                    in_author = false;
                    if let Some(current) = entry.as_mut() {
                        if !author_name.trim().is_empty() {
                            current.authors.push(author_name.trim().to_string());
                        }
                    }
                }
                if tag == current_tag {
                    current_tag.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(Page::new(entries, papers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_ATOM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <entry>
    <id>http://arxiv.org/abs/2301.12345v1</id>
    <updated>2023-02-01T00:00:00Z</updated>
    <published>2023-01-15T00:00:00Z</published>
    <title>Transformer Architectures
      for Long Documents</title>
    <summary>We study attention over
      very long inputs.</summary>
    <author><name>John Doe</name></author>
    <author><name>Jane Smith</name></author>
    <arxiv:doi>10.1234/example.2023</arxiv:doi>
    <link href="http://arxiv.org/abs/2301.12345v1" rel="alternate" type="text/html"/>
    <link href="http://arxiv.org/pdf/2301.12345v1" title="pdf" type="application/pdf"/>
    <category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/hep-th/9901001v1</id>
    <published>1999-01-04T00:00:00Z</published>
    <title>Old Style Identifier</title>
    <summary>Legacy.</summary>
    <author><name>A. Physicist</name></author>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_atom_feed() {
        let page = parse_atom_feed(SAMPLE_ATOM).unwrap();
        assert_eq!(page.raw, 2);
        let papers = page.papers;
        assert_eq!(papers.len(), 2);
        let p = &papers[0];
        assert_eq!(p.id, "2301.12345v1");
        assert_eq!(p.title, "Transformer Architectures for Long Documents");
        assert_eq!(p.abstract_text, "We study attention over very long inputs.");
        assert_eq!(p.authors, vec!["John Doe", "Jane Smith"]);
        assert_eq!(p.doi.as_deref(), Some("10.1234/example.2023"));
        assert_eq!(p.published_date, chrono::NaiveDate::from_ymd_opt(2023, 1, 15));
        assert_eq!(p.pdf_url.as_deref(), Some("http://arxiv.org/pdf/2301.12345v1"));
        assert_eq!(p.extra["categories"], serde_json::json!(["cs.CL", "cs.LG"]));

        assert_eq!(papers[1].id, "hep-th/9901001v1");
        assert_eq!(papers[1].pdf_url.as_deref(), Some("https://arxiv.org/pdf/hep-th/9901001v1"));
    }

    #[tokio::test]
    async fn test_search_against_mock_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/query"))
            .and(query_param("search_query", "all:transformer architectures"))
            .and(query_param("max_results", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_ATOM))
            .mount(&server)
            .await;

        let client = ArxivClient::with_base_urls(
            reqwest::Client::new(),
            &format!("{}/api/query", server.uri()),
            &format!("{}/pdf", server.uri()),
        );
        let papers = client
            .search(&SearchRequest::new("transformer architectures", 5))
            .await
            .unwrap();
        assert!(papers.len() <= 5);
        assert!(!papers.is_empty());
        for p in &papers {
            assert_eq!(p.source, Source::Arxiv);
            assert!(!p.title.is_empty());
            assert!(p.url.as_deref().unwrap().starts_with("http://arxiv.org/"));
        }
    }

    #[tokio::test]
    async fn test_download_writes_id_named_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pdf/2106.12345"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.4\n%fake\n".to_vec()),
            )
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("papers");
        let client = ArxivClient::with_base_urls(
            reqwest::Client::new(),
            &format!("{}/api/query", server.uri()),
            &format!("{}/pdf", server.uri()),
        );
        let saved = client.download("2106.12345", &dest).await.unwrap();
        assert_eq!(saved, dest.join("2106.12345.pdf"));
        assert!(saved.exists());
    }

    #[tokio::test]
    async fn test_read_reuses_pdf_for_prefixed_and_bare_ids() {
        // no mocks mounted: any network fetch would fail
        let server = MockServer::start().await;
        let tmp = TempDir::new().unwrap();
        crate::documents::tests::write_test_pdf(&tmp.path().join("2106.09685.pdf"), &["Low rank adaptation"], None);
        let client = ArxivClient::with_base_urls(
            reqwest::Client::new(),
            &format!("{}/api/query", server.uri()),
            &format!("{}/pdf", server.uri()),
        );
        for id in ["2106.09685", "arxiv:2106.09685", "arXiv:2106.09685"] {
            let text = client.read(id, tmp.path()).await.unwrap();
            assert!(text.contains("Low rank adaptation"), "{}", id);
        }
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download_rejects_html() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pdf/2106.00000"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not found</html>"))
            .mount(&server)
            .await;
        let tmp = TempDir::new().unwrap();
        let client = ArxivClient::with_base_urls(
            reqwest::Client::new(),
            &format!("{}/api/query", server.uri()),
            &format!("{}/pdf", server.uri()),
        );
        let err = client.download("2106.00000", tmp.path()).await.unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));
    }
}
