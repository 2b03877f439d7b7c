use std::path::{Path, PathBuf};

use super::{
    fetch_pdf_bytes, save_pdf, Capabilities, Paper, PaperSource, SearchRequest, Source,
    SourceError, BROWSER_USER_AGENT,
};
use async_trait::async_trait;
use md5::{Digest, Md5};
use regex::Regex;
use scraper::{Html, Selector};

pub const DEFAULT_SCIHUB_URL: &str = "https://sci-hub.se";

/// Looks up PDFs on a Sci-Hub mirror by DOI, PMID or article URL.
pub struct SciHubClient {
    client: reqwest::Client,
    base_url: String,
}

/// What a mirror page tells us about an identifier.
#[derive(Debug, PartialEq)]
struct Located {
    pdf_url: String,
    citation: Option<String>,
}

impl SciHubClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    async fn locate(&self, identifier: &str) -> Result<Option<Located>, SourceError> {
        if identifier.ends_with(".pdf") {
            return Ok(Some(Located { pdf_url: identifier.to_string(), citation: None }));
        }
        let page_url = format!("{}/{}", self.base_url, identifier);
        tracing::debug!(url = %page_url, "Looking up identifier on Sci-Hub");
        let resp = self
            .client
            .get(&page_url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceError::Api(format!("Sci-Hub mirror returned {}", status)));
        }
        let html = resp.text().await?;
        parse_mirror_page(&html, &self.base_url)
    }
}

fn resolve(src: &str, base_url: &str) -> String {
    if let Some(rest) = src.strip_prefix("//") {
        format!("https://{}", rest)
    } else if src.starts_with('/') {
        format!("{}{}", base_url, src)
    } else {
        src.to_string()
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("bad selector '{}': {:?}", css, e)))
}

/// Find the PDF location on a mirror page: embed, then iframe, then a
/// download button's `location.href`, then any anchor pointing at a PDF.
fn parse_mirror_page(html: &str, base_url: &str) -> Result<Option<Located>, SourceError> {
    if html.to_lowercase().contains("article not found") {
        tracing::warn!("Article not found on Sci-Hub");
        return Ok(None);
    }
    let doc = Html::parse_document(html);
    let onclick_re = Regex::new(r"location\.href='([^']+)'").map_err(|e| SourceError::Parse(e.to_string()))?;

    let embed = doc
        .select(&selector(r#"embed[type="application/pdf"]"#)?)
        .find_map(|e| e.value().attr("src"))
        .map(|src| resolve(src, base_url));
    let iframe = || -> Result<Option<String>, SourceError> {
        Ok(doc
            .select(&selector("iframe")?)
            .find_map(|e| e.value().attr("src"))
            .map(|src| resolve(src, base_url)))
    };
    let button = || -> Result<Option<String>, SourceError> {
        Ok(doc.select(&selector("button")?).find_map(|b| {
            let onclick = b.value().attr("onclick")?;
            if !onclick.to_lowercase().contains("pdf") {
                return None;
            }
            onclick_re.captures(onclick).and_then(|c| c.get(1)).map(|m| resolve(m.as_str(), base_url))
        }))
    };
    let anchor = || -> Result<Option<String>, SourceError> {
        Ok(doc.select(&selector("a[href]")?).find_map(|a| {
            let href = a.value().attr("href")?;
            if !href.to_lowercase().contains("pdf") {
                return None;
            }
            if href.starts_with('/') || href.starts_with("http") {
                Some(resolve(href, base_url))
            } else {
                None
            }
        }))
    };

    let pdf_url = match embed {
        Some(url) => Some(url),
        None => match iframe()? {
            Some(url) => Some(url),
            None => match button()? {
                Some(url) => Some(url),
                None => anchor()?,
            },
        },
    };

    let citation = doc
        .select(&selector("#citation")?)
        .next()
        .map(|c| super::collapse_whitespace(&c.text().collect::<String>()))
        .filter(|c| !c.is_empty());

    Ok(pdf_url.map(|pdf_url| Located { pdf_url, citation }))
}

/// `{md5(content)[..8]}_{name}.pdf`, where name comes from the PDF URL or the identifier.
fn pdf_filename(pdf_url: &str, identifier: &str, content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    let hash = format!("{:x}", hasher.finalize());
    let hash = &hash[..8];

    let last = pdf_url.split('/').next_back().unwrap_or("");
    let last = last.split('#').next().unwrap_or("");
    let last = last.split('?').next().unwrap_or("");
    match last.strip_suffix(".pdf") {
        Some(stem) if !stem.is_empty() => format!("{}_{}.pdf", hash, stem),
        _ => format!("{}_{}.pdf", hash, super::sanitize_id(identifier)),
    }
}

#[async_trait]
impl PaperSource for SciHubClient {
    fn source(&self) -> Source {
        Source::SciHub
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL_TEXT
    }

    /// The query is an identifier; the result is at most one record describing the located PDF.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Paper>, SourceError> {
        let identifier = request.query.trim();
        if identifier.is_empty() {
            return Ok(Vec::new());
        }
        let Some(located) = self.locate(identifier).await? else {
            return Ok(Vec::new());
        };
        let title = located.citation.clone().unwrap_or_else(|| identifier.to_string());
        let mut paper = Paper::new(Source::SciHub, identifier, title);
        if identifier.starts_with("10.") {
            paper.doi = Some(identifier.to_string());
        }
        paper.url = Some(format!("{}/{}", self.base_url, identifier));
        paper.pdf_url = Some(located.pdf_url);
        Ok(vec![paper.with_extra("mirror", self.base_url.clone())])
    }

    async fn download(&self, id: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let identifier = super::require_id(id)?;
        let located = self.locate(identifier).await?.ok_or_else(|| {
            SourceError::Api(format!("Could not find a PDF on Sci-Hub for '{}'", identifier))
        })?;
        let bytes = fetch_pdf_bytes(&self.client, &located.pdf_url).await?;
        let file_name = pdf_filename(&located.pdf_url, identifier, &bytes);
        save_pdf(dest_dir, &file_name, &bytes).await
    }

    /// File names depend on the content hash, so there is no cached copy to look up.
    async fn read(&self, id: &str, dest_dir: &Path) -> Result<String, SourceError> {
        let path = self.download(id, dest_dir).await?;
        crate::documents::extract_text_async(path)
            .await
            .map_err(|e| SourceError::Parse(format!("{:#}", e)))
    }
}
