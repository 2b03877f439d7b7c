use std::path::PathBuf;
use std::sync::Arc;

use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::apis::crossref::CrossRefClient;
use crate::apis::{paper_key, Paper, SearchFilters, Source};
use crate::config::Config;
use crate::documents;
use crate::knowledge::{self, KnowledgeStore};
use crate::search::{PaperSearch, SearchError};

const DEFAULT_MAX_RESULTS: u32 = 10;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Maximum results to return (default 10)")]
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct YearSearchParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Year or range: '2019', '2016-2020', '2010-', '-2015'")]
    year: Option<String>,
    #[schemars(description = "Maximum results to return (default 10)")]
    max_results: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RxivSearchParams {
    #[schemars(description = "Subject category, e.g. 'cell biology' (empty for all)")]
    query: String,
    #[schemars(description = "Maximum results to return (default 10)")]
    max_results: Option<u32>,
    #[schemars(description = "Look-back window in days (default 30)")]
    days: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CrossrefSearchParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Maximum results to return (default 10)")]
    max_results: Option<u32>,
    #[schemars(description = "CrossRef filter, e.g. 'from-pub-date:2020,has-full-text:true'")]
    filter: Option<String>,
    #[schemars(description = "Sort field: relevance, published, indexed, updated, is-referenced-by-count")]
    sort: Option<String>,
    #[schemars(description = "Sort order: asc or desc")]
    order: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct IacrSearchParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Maximum results to return (default 10)")]
    max_results: Option<u32>,
    #[schemars(description = "Fetch each paper's detail page for full metadata (default true)")]
    fetch_details: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SciHubSearchParams {
    #[schemars(description = "DOI, PMID or article URL")]
    query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AggregateSearchParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Restrict to these sources (e.g. [\"arxiv\", \"pubmed\"]); all enabled sources by default")]
    sources: Option<Vec<String>>,
    #[schemars(description = "Maximum results per source (default 5)")]
    max_results_per_source: Option<u32>,
    #[schemars(description = "Year filter for sources that support it")]
    year: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DoiParams {
    #[schemars(description = "DOI, e.g. 10.1038/nature12373")]
    doi: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PaperFileParams {
    #[schemars(description = "Paper identifier as returned by the matching search tool")]
    paper_id: String,
    #[schemars(description = "Directory for the PDF (default ./downloads)")]
    save_path: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct StorePaperParams {
    #[schemars(description = "Paper record exactly as returned by a search tool")]
    paper: serde_json::Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PaperRefParams {
    #[schemars(description = "Source the paper came from, e.g. 'arxiv'")]
    source: String,
    #[schemars(description = "Paper identifier within that source")]
    paper_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct KnowledgeSearchParams {
    #[schemars(description = "Keywords matched against title, abstract and authors")]
    query: String,
    #[schemars(description = "Maximum results (default 10)")]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AddConceptParams {
    #[schemars(description = "Concept name, e.g. 'Graph Neural Networks'")]
    name: String,
    #[schemars(description = "Short description")]
    description: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RelateParams {
    #[schemars(description = "Concept id ('concept:...') or name")]
    concept: String,
    #[schemars(description = "Stored paper key, 'source:id'")]
    paper_key: String,
    #[schemars(description = "Relation strength between 0.0 and 1.0 (default 1.0)")]
    strength: Option<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SimilarParams {
    #[schemars(description = "Stored paper key, 'source:id'")]
    paper_key: String,
    #[schemars(description = "Number of papers to return (default 10)")]
    top_k: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PdfPathParams {
    #[schemars(description = "Path to a local PDF file")]
    pdf_path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct UrlParams {
    #[schemars(description = "http(s) URL of a PDF document")]
    url: String,
}

#[derive(Serialize)]
struct DownloadResult<'a> {
    source: Source,
    paper_id: &'a str,
    path: String,
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn store_error(e: anyhow::Error) -> McpError {
    McpError::internal_error(format!("Knowledge store error: {:#}", e), None)
}

/// Caller mistakes become `invalid_params`; a platform failure is reported as
/// a failed tool call so the client sees the platform's message.
fn search_error(e: SearchError) -> Result<CallToolResult, McpError> {
    match e {
        SearchError::Source { platform, cause } => Ok(CallToolResult::error(vec![Content::text(
            format!("{}: {}", platform, cause),
        )])),
        other => Err(McpError::invalid_params(other.to_string(), None)),
    }
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ScholarHubServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    search: PaperSearch,
    crossref: Arc<CrossRefClient>,
    http: reqwest::Client,
    /// Opened on first use so a broken store does not take search down with it.
    knowledge: Arc<Mutex<Option<KnowledgeStore>>>,
}

#[tool_router]
impl ScholarHubServer {
    pub fn create(config: Config) -> anyhow::Result<Self> {
        let http = config.http_client()?;
        let registry = config.build_registry(&http)?;
        let crossref = Arc::new(config.crossref_client(http.clone()));

        tracing::info!(
            "Initialized {} paper sources, data_dir={}",
            registry.len(),
            config.data_dir.display()
        );

        Ok(Self {
            tool_router: Self::tool_router(),
            search: PaperSearch::new(registry, config.call_timeout()),
            config: Arc::new(config),
            crossref,
            http,
            knowledge: Arc::new(Mutex::new(None)),
        })
    }

    async fn knowledge(&self) -> Result<MappedMutexGuard<'_, KnowledgeStore>, McpError> {
        let mut guard = self.knowledge.lock().await;
        if guard.is_none() {
            let store = KnowledgeStore::open(&self.config.knowledge).await.map_err(store_error)?;
            *guard = Some(store);
        }
        MutexGuard::try_map(guard, |store| store.as_mut())
            .map_err(|_| McpError::internal_error("Knowledge store is not open", None))
    }

    async fn search_platform(
        &self,
        source: Source,
        query: &str,
        max_results: Option<u32>,
        filters: SearchFilters,
    ) -> Result<CallToolResult, McpError> {
        let max = max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        match self.search.search(source.as_str(), query, max, filters).await {
            Ok(papers) => json_result(&papers),
            Err(e) => search_error(e),
        }
    }

    fn save_dir(&self, save_path: Option<String>) -> PathBuf {
        save_path
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.download_dir.clone())
    }

    async fn download_platform(&self, source: Source, params: PaperFileParams) -> Result<CallToolResult, McpError> {
        let dir = self.save_dir(params.save_path);
        match self.search.download(source.as_str(), &params.paper_id, &dir).await {
            Ok(path) => json_result(&DownloadResult {
                source,
                paper_id: params.paper_id.trim(),
                path: path.display().to_string(),
            }),
            Err(e) => search_error(e),
        }
    }

    async fn read_platform(&self, source: Source, params: PaperFileParams) -> Result<CallToolResult, McpError> {
        let dir = self.save_dir(params.save_path);
        match self.search.read(source.as_str(), &params.paper_id, &dir).await {
            Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
            Err(e) => search_error(e),
        }
    }

    #[tool(description = "List every paper source with its status and capabilities")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        json_result(&self.config.source_status())
    }

    // ── Search ──────────────────────────────────────────────────────────────

    #[tool(description = "Search arXiv preprints")]
    async fn search_arxiv(&self, Parameters(p): Parameters<SearchParams>) -> Result<CallToolResult, McpError> {
        self.search_platform(Source::Arxiv, &p.query, p.max_results, SearchFilters::default()).await
    }

    #[tool(description = "Search PubMed biomedical literature")]
    async fn search_pubmed(&self, Parameters(p): Parameters<SearchParams>) -> Result<CallToolResult, McpError> {
        self.search_platform(Source::Pubmed, &p.query, p.max_results, SearchFilters::default()).await
    }

    #[tool(description = "List recent bioRxiv preprints in a category")]
    async fn search_biorxiv(&self, Parameters(p): Parameters<RxivSearchParams>) -> Result<CallToolResult, McpError> {
        let filters = SearchFilters { days: p.days, ..Default::default() };
        self.search_platform(Source::Biorxiv, &p.query, p.max_results, filters).await
    }

    #[tool(description = "List recent medRxiv preprints in a category")]
    async fn search_medrxiv(&self, Parameters(p): Parameters<RxivSearchParams>) -> Result<CallToolResult, McpError> {
        let filters = SearchFilters { days: p.days, ..Default::default() };
        self.search_platform(Source::Medrxiv, &p.query, p.max_results, filters).await
    }

    #[tool(description = "Search Semantic Scholar, optionally restricted to a year range")]
    async fn search_semantic(&self, Parameters(p): Parameters<YearSearchParams>) -> Result<CallToolResult, McpError> {
        let filters = SearchFilters { year: p.year, ..Default::default() };
        self.search_platform(Source::Semantic, &p.query, p.max_results, filters).await
    }

    #[tool(description = "Search CrossRef metadata with optional filter and sort")]
    async fn search_crossref(&self, Parameters(p): Parameters<CrossrefSearchParams>) -> Result<CallToolResult, McpError> {
        let filters = SearchFilters {
            filter: p.filter,
            sort: p.sort,
            order: p.order,
            ..Default::default()
        };
        self.search_platform(Source::Crossref, &p.query, p.max_results, filters).await
    }

    #[tool(description = "Search the IACR Cryptology ePrint Archive")]
    async fn search_iacr(&self, Parameters(p): Parameters<IacrSearchParams>) -> Result<CallToolResult, McpError> {
        let filters = SearchFilters { fetch_details: p.fetch_details, ..Default::default() };
        self.search_platform(Source::Iacr, &p.query, p.max_results, filters).await
    }

    #[tool(description = "Search Google Scholar (HTML scraping; may be rate limited)")]
    async fn search_google_scholar(&self, Parameters(p): Parameters<YearSearchParams>) -> Result<CallToolResult, McpError> {
        let filters = SearchFilters { year: p.year, ..Default::default() };
        self.search_platform(Source::GoogleScholar, &p.query, p.max_results, filters).await
    }

    #[tool(description = "Search the configured SearXNG instance's science category")]
    async fn search_searxng(&self, Parameters(p): Parameters<SearchParams>) -> Result<CallToolResult, McpError> {
        self.search_platform(Source::Searxng, &p.query, p.max_results, SearchFilters::default()).await
    }

    #[tool(description = "Look up a DOI, PMID or URL on the configured Sci-Hub mirror")]
    async fn search_sci_hub(&self, Parameters(p): Parameters<SciHubSearchParams>) -> Result<CallToolResult, McpError> {
        self.search_platform(Source::SciHub, &p.query, Some(1), SearchFilters::default()).await
    }

    #[tool(description = "Search papers indexed on the Hugging Face Hub")]
    async fn search_huggingface(&self, Parameters(p): Parameters<SearchParams>) -> Result<CallToolResult, McpError> {
        self.search_platform(Source::Huggingface, &p.query, p.max_results, SearchFilters::default()).await
    }

    #[tool(description = "Search several sources concurrently and concatenate the results (no deduplication)")]
    async fn search_papers(&self, Parameters(p): Parameters<AggregateSearchParams>) -> Result<CallToolResult, McpError> {
        let max = p.max_results_per_source.unwrap_or(5);
        let filters = SearchFilters { year: p.year, ..Default::default() };
        let papers = self
            .search
            .search_all(&p.query, max, p.sources.as_deref(), filters)
            .await
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
        json_result(&papers)
    }

    #[tool(description = "Fetch one CrossRef record by DOI")]
    async fn get_crossref_paper_by_doi(&self, Parameters(p): Parameters<DoiParams>) -> Result<CallToolResult, McpError> {
        let doi = p.doi.trim();
        if doi.is_empty() {
            return Err(McpError::invalid_params("doi must not be empty", None));
        }
        match self.crossref.get_paper_by_doi(doi).await {
            Ok(Some(paper)) => json_result(&paper),
            Ok(None) => Ok(CallToolResult::error(vec![Content::text(format!("No CrossRef record for DOI {}", doi))])),
            Err(e) => {
                tracing::warn!("CrossRef lookup of {} failed: {}", doi, e);
                Ok(CallToolResult::error(vec![Content::text(format!("CrossRef lookup failed: {}", e))]))
            }
        }
    }

    // ── Download ────────────────────────────────────────────────────────────

    #[tool(description = "Download an arXiv paper's PDF")]
    async fn download_arxiv(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::Arxiv, p).await
    }

    #[tool(description = "PubMed has no PDFs; explains where to get the full text")]
    async fn download_pubmed(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::Pubmed, p).await
    }

    #[tool(description = "Download a bioRxiv preprint's PDF by DOI")]
    async fn download_biorxiv(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::Biorxiv, p).await
    }

    #[tool(description = "Download a medRxiv preprint's PDF by DOI")]
    async fn download_medrxiv(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::Medrxiv, p).await
    }

    #[tool(description = "Download a Semantic Scholar paper's open-access PDF")]
    async fn download_semantic(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::Semantic, p).await
    }

    #[tool(description = "CrossRef has no PDFs; explains where to get the full text")]
    async fn download_crossref(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::Crossref, p).await
    }

    #[tool(description = "Download an IACR ePrint PDF (id like 2023/1234)")]
    async fn download_iacr(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::Iacr, p).await
    }

    #[tool(description = "Download a PDF from the Sci-Hub mirror by DOI, PMID or URL")]
    async fn download_sci_hub(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::SciHub, p).await
    }

    #[tool(description = "Download a Hugging Face paper's PDF (via arXiv)")]
    async fn download_huggingface(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.download_platform(Source::Huggingface, p).await
    }

    // ── Read ────────────────────────────────────────────────────────────────

    #[tool(description = "Extract the text of an arXiv paper")]
    async fn read_arxiv_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::Arxiv, p).await
    }

    #[tool(description = "PubMed has no full text; explains where to get it")]
    async fn read_pubmed_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::Pubmed, p).await
    }

    #[tool(description = "Extract the text of a bioRxiv preprint")]
    async fn read_biorxiv_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::Biorxiv, p).await
    }

    #[tool(description = "Extract the text of a medRxiv preprint")]
    async fn read_medrxiv_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::Medrxiv, p).await
    }

    #[tool(description = "Extract the text of a Semantic Scholar paper's open-access PDF")]
    async fn read_semantic_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::Semantic, p).await
    }

    #[tool(description = "CrossRef has no full text; explains where to get it")]
    async fn read_crossref_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::Crossref, p).await
    }

    #[tool(description = "Extract the text of an IACR ePrint paper")]
    async fn read_iacr_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::Iacr, p).await
    }

    #[tool(description = "Download from the Sci-Hub mirror and extract the text")]
    async fn read_sci_hub_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::SciHub, p).await
    }

    #[tool(description = "Extract the text of a Hugging Face paper")]
    async fn read_huggingface_paper(&self, Parameters(p): Parameters<PaperFileParams>) -> Result<CallToolResult, McpError> {
        self.read_platform(Source::Huggingface, p).await
    }

    // ── Knowledge store ─────────────────────────────────────────────────────

    #[tool(description = "Persist a paper record in the knowledge store; returns its key 'source:id'")]
    async fn store_paper_knowledge(&self, Parameters(p): Parameters<StorePaperParams>) -> Result<CallToolResult, McpError> {
        let paper: Paper = serde_json::from_value(p.paper)
            .map_err(|e| McpError::invalid_params(format!("Not a paper record: {}", e), None))?;
        if paper.id.trim().is_empty() || paper.title.trim().is_empty() {
            return Err(McpError::invalid_params("paper needs a non-empty id and title", None));
        }
        let key = self.knowledge().await?.store_paper(&paper).await.map_err(store_error)?;
        json_result(&serde_json::json!({ "key": key }))
    }

    #[tool(description = "Get a stored paper and the concepts linked to it")]
    async fn get_paper_knowledge(&self, Parameters(p): Parameters<PaperRefParams>) -> Result<CallToolResult, McpError> {
        let source: Source = p
            .source
            .parse()
            .map_err(|e: crate::apis::UnknownSource| McpError::invalid_params(e.to_string(), None))?;
        let key = paper_key(source, p.paper_id.trim());
        let store = self.knowledge().await?;
        let Some(paper) = store.get_paper_by_key(&key).await.map_err(store_error)? else {
            return Ok(CallToolResult::error(vec![Content::text(format!("No stored paper {}", key))]));
        };
        let concepts = store.concepts_for_paper(&key).await.map_err(store_error)?;
        json_result(&serde_json::json!({ "key": key, "paper": paper, "concepts": concepts }))
    }

    #[tool(description = "Keyword search (BM25) over stored papers")]
    async fn search_knowledge(&self, Parameters(p): Parameters<KnowledgeSearchParams>) -> Result<CallToolResult, McpError> {
        let limit = p.limit.unwrap_or(10) as usize;
        let papers = self
            .knowledge()
            .await?
            .search_papers(&p.query, limit)
            .await
            .map_err(store_error)?;
        json_result(&papers)
    }

    #[tool(description = "Create or update a concept; the id is derived from the name")]
    async fn add_concept_knowledge(&self, Parameters(p): Parameters<AddConceptParams>) -> Result<CallToolResult, McpError> {
        if knowledge::concept_id(&p.name).is_none() {
            return Err(McpError::invalid_params("concept name must contain a letter or digit", None));
        }
        let concept = self
            .knowledge()
            .await?
            .add_concept(&p.name, p.description.as_deref().unwrap_or(""))
            .await
            .map_err(store_error)?;
        json_result(&concept)
    }

    #[tool(description = "Link a concept to a stored paper with a strength between 0 and 1")]
    async fn relate_paper_concept(&self, Parameters(p): Parameters<RelateParams>) -> Result<CallToolResult, McpError> {
        let strength = p.strength.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&strength) {
            return Err(McpError::invalid_params(
                format!("strength must be between 0.0 and 1.0, got {}", strength),
                None,
            ));
        }
        let concept_id = if p.concept.starts_with("concept:") {
            p.concept.clone()
        } else {
            knowledge::concept_id(&p.concept)
                .ok_or_else(|| McpError::invalid_params("concept must contain a letter or digit", None))?
        };
        let store = self.knowledge().await?;
        if store.get_concept(&concept_id).await.map_err(store_error)?.is_none() {
            return Err(McpError::invalid_params(format!("Unknown concept '{}'", concept_id), None));
        }
        if store.get_paper_by_key(&p.paper_key).await.map_err(store_error)?.is_none() {
            return Err(McpError::invalid_params(format!("No stored paper '{}'", p.paper_key), None));
        }
        let relation = store.relate(&concept_id, &p.paper_key, strength).await.map_err(store_error)?;
        json_result(&relation)
    }

    #[tool(description = "Stored papers sharing concepts with the given paper, ranked by weighted concept overlap")]
    async fn get_similar_papers_knowledge(&self, Parameters(p): Parameters<SimilarParams>) -> Result<CallToolResult, McpError> {
        let top_k = p.top_k.unwrap_or(10) as usize;
        let store = self.knowledge().await?;
        if store.get_paper_by_key(&p.paper_key).await.map_err(store_error)?.is_none() {
            return Err(McpError::invalid_params(format!("No stored paper '{}'", p.paper_key), None));
        }
        let similar = store.similar_papers(&p.paper_key, top_k).await.map_err(store_error)?;
        json_result(&similar)
    }

    #[tool(description = "Counts of stored papers, concepts and relationships")]
    async fn get_knowledge_stats(&self) -> Result<CallToolResult, McpError> {
        let stats = self.knowledge().await?.stats().await.map_err(store_error)?;
        json_result(&stats)
    }

    // ── Documents ───────────────────────────────────────────────────────────

    #[tool(description = "Extract per-page markdown text and metadata from a local PDF")]
    async fn process_pdf_advanced(&self, Parameters(p): Parameters<PdfPathParams>) -> Result<CallToolResult, McpError> {
        let path = PathBuf::from(p.pdf_path.trim());
        if !path.is_file() {
            return Err(McpError::invalid_params(format!("No such file: {}", path.display()), None));
        }
        let processed = documents::process_pdf_async(path)
            .await
            .map_err(|e| McpError::internal_error(format!("{:#}", e), None))?;
        json_result(&processed)
    }

    #[tool(description = "Download a PDF from a URL and extract its text and metadata")]
    async fn process_document_url(&self, Parameters(p): Parameters<UrlParams>) -> Result<CallToolResult, McpError> {
        let url = p.url.trim();
        let parsed = url::Url::parse(url)
            .map_err(|e| McpError::invalid_params(format!("Invalid URL '{}': {}", url, e), None))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(McpError::invalid_params("Only http(s) URLs are supported", None));
        }
        match documents::process_url(&self.http, url).await {
            Ok(processed) => json_result(&processed),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!("{:#}", e))])),
        }
    }
}

#[tool_handler]
impl ServerHandler for ScholarHubServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Search, download and read academic papers from arXiv, PubMed, bioRxiv, \
                 medRxiv, Semantic Scholar, CrossRef, IACR, Google Scholar, SearXNG, \
                 Sci-Hub and Hugging Face. Store papers in a local knowledge store, \
                 link them to concepts and find related work by concept overlap."
                    .into(),
            ),
        }
    }
}

/// Serve MCP over stdin/stdout until the client disconnects.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting scholar-hub MCP server");
    let server = ScholarHubServer::create(config)?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
