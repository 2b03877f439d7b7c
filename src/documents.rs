use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use lopdf::{Dictionary, Document, Object};
use serde::Serialize;

/// Document-level PDF metadata from the trailer's Info dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub pages: usize,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedDocument {
    /// Markdown, one `## Page N` section per page.
    pub text: String,
    pub metadata: DocumentMetadata,
}

fn load(path: &Path) -> anyhow::Result<Document> {
    Document::load(path).with_context(|| format!("Failed to open PDF {}", path.display()))
}

/// Text of each page in order. A page lopdf cannot decode comes back empty;
/// the document fails only when no page decodes.
fn page_texts(doc: &Document, path: &Path) -> anyhow::Result<Vec<String>> {
    let mut texts = Vec::new();
    let mut last_error = None;
    let mut failed = 0usize;
    for page_number in doc.get_pages().keys().copied() {
        match doc.extract_text(&[page_number]) {
            Ok(text) => texts.push(text.trim().to_string()),
            Err(e) => {
                tracing::warn!("Skipping page {} of {}: {}", page_number, path.display(), e);
                failed += 1;
                last_error = Some(e);
                texts.push(String::new());
            }
        }
    }
    match last_error {
        Some(e) if failed == texts.len() => Err(anyhow::Error::new(e)
            .context(format!("Failed to extract text from any page of {}", path.display()))),
        _ => Ok(texts),
    }
}

/// Plain text of every page, separated by blank lines.
pub fn extract_text(path: &Path) -> anyhow::Result<String> {
    let doc = load(path)?;
    let pages = page_texts(&doc, path)?;
    Ok(pages.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join("\n\n"))
}

pub async fn extract_text_async(path: PathBuf) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || extract_text(&path))
        .await
        .context("PDF extraction task panicked")?
}

/// PDF strings are either PDFDocEncoding or UTF-16BE with a byte order mark.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
    match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn info_field(info: Option<&Dictionary>, key: &[u8]) -> Option<String> {
    let bytes = info?.get(key).ok()?.as_str().ok()?;
    let value = decode_pdf_string(bytes).trim().to_string();
    (!value.is_empty()).then_some(value)
}

pub fn process_pdf(path: &Path) -> anyhow::Result<ProcessedDocument> {
    let file_size = std::fs::metadata(path)
        .with_context(|| format!("Cannot stat {}", path.display()))?
        .len();
    let doc = load(path)?;
    let pages = page_texts(&doc, path)?;

    let mut text = String::new();
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            text.push_str("\n\n");
        }
        text.push_str(&format!("## Page {}\n\n{}", i + 1, page));
    }

    let info = info_dictionary(&doc);
    let metadata = DocumentMetadata {
        pages: pages.len(),
        title: info_field(info, b"Title"),
        author: info_field(info, b"Author"),
        subject: info_field(info, b"Subject"),
        creator: info_field(info, b"Creator"),
        producer: info_field(info, b"Producer"),
        file_size,
    };
    tracing::debug!(pages = metadata.pages, "Processed {}", path.display());
    Ok(ProcessedDocument { text, metadata })
}

pub async fn process_pdf_async(path: PathBuf) -> anyhow::Result<ProcessedDocument> {
    tokio::task::spawn_blocking(move || process_pdf(&path))
        .await
        .context("PDF processing task panicked")?
}

/// Download a PDF into a temporary file and process it.
pub async fn process_url(client: &reqwest::Client, url: &str) -> anyhow::Result<ProcessedDocument> {
    let parsed = url::Url::parse(url).with_context(|| format!("Invalid URL '{}'", url))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("Only http(s) URLs can be processed, got '{}'", parsed.scheme());
    }
    let bytes = crate::apis::fetch_pdf_bytes(client, url).await?;
    let mut file = tempfile::Builder::new()
        .suffix(".pdf")
        .tempfile()
        .context("Failed to create temporary file")?;
    file.write_all(&bytes).context("Failed to write downloaded PDF")?;
    let path = file.path().to_path_buf();
    let processed = process_pdf_async(path).await?;
    drop(file);
    Ok(processed)
}
