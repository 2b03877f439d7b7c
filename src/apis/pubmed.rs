use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{collect_pages, Page, Paper, PaperSource, SearchRequest, Source, SourceError};
use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

const BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// efetch batch size; esearch itself allows up to 10 000 ids per call.
const PAGE_SIZE: u32 = 200;

pub struct PubMedClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    email: Option<String>,
}

impl PubMedClient {
    pub fn new(client: reqwest::Client, api_key: Option<String>, email: Option<String>) -> Self {
        Self { client, base_url: BASE_URL.to_string(), api_key, email }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// NCBI allows 3 requests/s anonymously and 10/s with a key.
    fn request_interval(&self) -> Duration {
        if self.api_key.is_some() {
            Duration::from_millis(100)
        } else {
            Duration::from_millis(340)
        }
    }

    fn common_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("tool", "scholar-hub".to_string())];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        if let Some(email) = &self.email {
            params.push(("email", email.clone()));
        }
        params
    }

    async fn search_ids(&self, query: &str, start: u32, count: u32) -> Result<Vec<String>, SourceError> {
        let mut params = self.common_params();
        params.extend([
            ("db", "pubmed".to_string()),
            ("term", query.to_string()),
            ("retstart", start.to_string()),
            ("retmax", count.to_string()),
            ("retmode", "json".to_string()),
        ]);
        let resp: ESearchResponse = self
            .client
            .get(format!("{}/esearch.fcgi", self.base_url))
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.esearchresult.idlist)
    }

    async fn fetch_articles(&self, ids: &[String]) -> Result<Vec<Paper>, SourceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        tokio::time::sleep(self.request_interval()).await;
        let mut params = self.common_params();
        params.extend([
            ("db", "pubmed".to_string()),
            ("id", ids.join(",")),
            ("retmode", "xml".to_string()),
        ]);
        let xml = self
            .client
            .get(format!("{}/efetch.fcgi", self.base_url))
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_efetch(&xml)
    }

    async fn fetch_page(&self, query: &str, start: u32, count: u32) -> Result<Page, SourceError> {
        let ids = self.search_ids(query, start, count).await?;
        let papers = self.fetch_articles(&ids).await?;
        Ok(Page::new(ids.len(), papers))
    }
}

#[derive(Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

#[async_trait]
impl PaperSource for PubMedClient {
    fn source(&self) -> Source {
        Source::Pubmed
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        collect_pages(request.max_results, PAGE_SIZE, self.request_interval(), |start, count| {
            self.fetch_page(&request.query, start, count)
        })
        .await
    }

    async fn download(&self, _id: &str, _dest_dir: &Path) -> Result<PathBuf, SourceError> {
        Err(SourceError::Unsupported(
            "PubMed does not provide direct PDF downloads. PubMed is a citation index; \
             use the paper's DOI or URL to reach the publisher's full text."
                .into(),
        ))
    }

    async fn read(&self, _id: &str, _dest_dir: &Path) -> Result<String, SourceError> {
        Err(SourceError::Unsupported(
            "PubMed papers cannot be read directly. Only metadata and abstracts are available \
             through the PubMed API; use the paper's DOI or URL to reach the full text."
                .into(),
        ))
    }
}

#[derive(Default)]
struct ArticleBuilder {
    pmid: String,
    title: String,
    abstract_parts: Vec<String>,
    authors: Vec<String>,
    journal: String,
    year: String,
    month: String,
    day: String,
    medline_date: String,
    doi: Option<String>,
    keywords: Vec<String>,
}

#[derive(Default)]
struct AuthorBuilder {
    last: String,
    fore: String,
    collective: String,
}

impl ArticleBuilder {
    fn published_date(&self) -> Option<NaiveDate> {
        let (year, month_text) = if self.year.is_empty() {
            // MedlineDate looks like "2019 Mar-Apr"
            let mut parts = self.medline_date.split_whitespace();
            (parts.next().unwrap_or("").to_string(), parts.next().unwrap_or("").to_string())
        } else {
            (self.year.clone(), self.month.clone())
        };
        let year: i32 = year.trim().parse().ok()?;
        let month = parse_month(&month_text).unwrap_or(1);
        let day = self.day.trim().parse().unwrap_or(1);
        NaiveDate::from_ymd_opt(year, month, day).or_else(|| NaiveDate::from_ymd_opt(year, month, 1))
    }

    fn build(self) -> Option<Paper> {
        let title = super::collapse_whitespace(&self.title);
        if self.pmid.is_empty() || title.is_empty() {
            return None;
        }
        let published_date = self.published_date();
        let mut paper = Paper::new(Source::Pubmed, self.pmid.clone(), title);
        paper.abstract_text = self.abstract_parts.join("\n");
        paper.authors = self.authors;
        paper.doi = self.doi;
        paper.published_date = published_date;
        paper.url = Some(format!("https://pubmed.ncbi.nlm.nih.gov/{}/", self.pmid));
        Some(paper.with_extra("journal", self.journal).with_extra("keywords", self.keywords))
    }
}

fn parse_month(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Ok(n) = text.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    const MONTHS: [&str; 12] =
        ["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"];
    let prefix = text.get(..3)?.to_lowercase();
    MONTHS.iter().position(|m| *m == prefix).map(|i| i as u32 + 1)
}

fn parse_efetch(xml: &str) -> Result<Vec<Paper>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut article: Option<ArticleBuilder> = None;
    let mut author: Option<AuthorBuilder> = None;
    let mut abstract_part = String::new();
    let mut doi_id = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let in_references = stack.iter().any(|t| t == "ReferenceList");
                match tag.as_str() {
                    "PubmedArticle" => article = Some(ArticleBuilder::default()),
                    "Author" if !in_references => author = Some(AuthorBuilder::default()),
                    "AbstractText" => {
                        abstract_part.clear();
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"Label" {
                                abstract_part.push_str(&String::from_utf8_lossy(&attr.value));
                                abstract_part.push_str(": ");
                            }
                        }
                    }
                    "ArticleId" | "ELocationID" if !in_references => {
                        doi_id = e.attributes().flatten().any(|a| {
                            matches!(a.key.as_ref(), b"IdType" | b"EIdType") && a.value.as_ref() == b"doi"
                        });
                    }
                    _ => {}
                }
                stack.push(tag);
            }
            Ok(Event::Text(e)) => {
                let Some(current) = article.as_mut() else {
                    buf.clear();
                    continue;
                };
                let text = e.unescape().unwrap_or_default().to_string();
                let tail = stack.last().map(String::as_str).unwrap_or("");
                let parent = stack.len().checked_sub(2).and_then(|i| stack.get(i)).map(String::as_str);
                let within = |name: &str| stack.iter().any(|t| t == name);

                if within("ReferenceList") || within("CommentsCorrectionsList") {
                    // citations carry their own PMIDs and DOIs
                } else if tail == "PMID" && parent == Some("MedlineCitation") && current.pmid.is_empty() {
                    current.pmid = text.trim().to_string();
                } else if within("ArticleTitle") {
                    current.title.push_str(&text);
                } else if within("AbstractText") {
                    abstract_part.push_str(&text);
                } else if let Some(a) = author.as_mut() {
                    match tail {
                        "LastName" => a.last.push_str(text.trim()),
                        "ForeName" => a.fore.push_str(text.trim()),
                        "CollectiveName" => a.collective.push_str(text.trim()),
                        _ => {}
                    }
                } else if tail == "Title" && parent == Some("Journal") {
                    current.journal.push_str(text.trim());
                } else if within("PubDate") {
                    match tail {
                        "Year" => current.year = text.trim().to_string(),
                        "Month" => current.month = text.trim().to_string(),
                        "Day" => current.day = text.trim().to_string(),
                        "MedlineDate" => current.medline_date = text.trim().to_string(),
                        _ => {}
                    }
                } else if (tail == "ArticleId" || tail == "ELocationID") && doi_id && current.doi.is_none() {
                    current.doi = Some(text.trim().to_string());
                } else if tail == "Keyword" {
                    current.keywords.push(text.trim().to_string());
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                stack.pop();
                match tag.as_str() {
                    "PubmedArticle" => {
                        if let Some(paper) = article.take().and_then(ArticleBuilder::build) {
                            papers.push(paper);
                        }
                    }
                    "Author" => {
                        if let (Some(a), Some(current)) = (author.take(), article.as_mut()) {
                            let name = if a.collective.is_empty() {
                                format!("{} {}", a.fore, a.last).trim().to_string()
                            } else {
                                a.collective
                            };
                            if !name.is_empty() {
                                current.authors.push(name);
                            }
                        }
                    }
                    "AbstractText" => {
                        if let Some(current) = article.as_mut() {
                            let part = super::collapse_whitespace(&abstract_part);
                            if !part.is_empty() {
                                current.abstract_parts.push(part);
                            }
                        }
                    }
                    "ArticleId" | "ELocationID" => doi_id = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("PubMed XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(papers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_EFETCH: &str = r#"<?xml version="1.0" ?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">31452104</PMID>
      <Article PubModel="Print">
        <Journal>
          <Title>Nature methods</Title>
          <JournalIssue><PubDate><Year>2019</Year><Month>Sep</Month><Day>02</Day></PubDate></JournalIssue>
        </Journal>
        <ArticleTitle>Deep learning for <i>cell</i> segmentation.</ArticleTitle>
        <ELocationID EIdType="doi" ValidYN="Y">10.1038/s41592-019-0537-1</ELocationID>
        <Abstract>
          <AbstractText Label="BACKGROUND">Segmentation is hard.</AbstractText>
          <AbstractText Label="RESULTS">We made it easier.</AbstractText>
        </Abstract>
        <AuthorList>
          <Author><LastName>Moen</LastName><ForeName>Erick</ForeName></Author>
          <Author><CollectiveName>Cell Consortium</CollectiveName></Author>
        </AuthorList>
      </Article>
      <CommentsCorrectionsList>
        <CommentsCorrections><PMID Version="1">11111111</PMID></CommentsCorrections>
      </CommentsCorrectionsList>
      <KeywordList><Keyword>segmentation</Keyword></KeywordList>
    </MedlineCitation>
    <PubmedData>
      <ReferenceList><Reference><ArticleIdList><ArticleId IdType="doi">10.9999/ref</ArticleId></ArticleIdList></Reference></ReferenceList>
    </PubmedData>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">22222222</PMID>
      <Article>
        <Journal><Title>Some Journal</Title>
          <JournalIssue><PubDate><MedlineDate>2018 Mar-Apr</MedlineDate></PubDate></JournalIssue>
        </Journal>
        <ArticleTitle>Second article</ArticleTitle>
      </Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_efetch() {
        let papers = parse_efetch(SAMPLE_EFETCH).unwrap();
        assert_eq!(papers.len(), 2);
        let p = &papers[0];
        assert_eq!(p.id, "31452104");
        assert_eq!(p.title, "Deep learning for cell segmentation.");
        assert_eq!(p.authors, vec!["Erick Moen", "Cell Consortium"]);
        assert_eq!(p.doi.as_deref(), Some("10.1038/s41592-019-0537-1"));
        assert_eq!(p.published_date, NaiveDate::from_ymd_opt(2019, 9, 2));
        assert_eq!(p.abstract_text, "BACKGROUND: Segmentation is hard.\nRESULTS: We made it easier.");
        assert_eq!(p.extra["journal"], "Nature methods");
        assert_eq!(p.url.as_deref(), Some("https://pubmed.ncbi.nlm.nih.gov/31452104/"));

        assert_eq!(papers[1].published_date, NaiveDate::from_ymd_opt(2018, 3, 1));
        assert!(papers[1].doi.is_none());
    }

    #[tokio::test]
    async fn test_search_runs_esearch_then_efetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .and(query_param("term", "cell segmentation"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "esearchresult": { "count": "2", "idlist": ["31452104", "22222222"] }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .and(query_param("id", "31452104,22222222"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_EFETCH))
            .mount(&server)
            .await;

        let client = PubMedClient::new(reqwest::Client::new(), Some("k".into()), None)
            .with_base_url(&server.uri());
        let papers = client.search(&SearchRequest::new("cell segmentation", 10)).await.unwrap();
        assert_eq!(papers.len(), 2);
        assert!(papers.iter().all(|p| p.source == Source::Pubmed));
    }

    #[tokio::test]
    async fn test_download_is_unsupported() {
        let client = PubMedClient::new(reqwest::Client::new(), None, None);
        let err = client.download("31452104", Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, SourceError::Unsupported(msg) if msg.contains("PubMed")));
    }
}
