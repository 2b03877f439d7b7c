use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::apis::{self, Capabilities, PaperSource, Source};
use crate::knowledge::{KnowledgeConfig, DEFAULT_DATABASE, DEFAULT_NAMESPACE};
use crate::search::SourceRegistry;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CROSSREF_MAILTO: &str = "paper-search@example.org";

/// Settings read once at start-up from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Per HTTP request.
    pub timeout: Duration,
    /// Empty means every source.
    pub enabled_sources: Vec<Source>,
    pub semantic_scholar_api_key: Option<String>,
    pub pubmed_api_key: Option<String>,
    pub ncbi_email: Option<String>,
    pub crossref_mailto: String,
    pub huggingface_token: Option<String>,
    pub searxng_url: String,
    pub scihub_url: String,
    pub google_scholar_proxy: Option<String>,
    pub knowledge: KnowledgeConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an arbitrary variable lookup. Blank values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = var("SCHOLAR_HUB_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir(&lookup).join(".scholar-hub"));
        let download_dir = var("SCHOLAR_HUB_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./downloads"));

        let timeout_secs = match var("SCHOLAR_HUB_TIMEOUT_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    tracing::warn!("Ignoring invalid SCHOLAR_HUB_TIMEOUT_SECS '{}'", raw);
                    DEFAULT_TIMEOUT_SECS
                }
            },
            None => DEFAULT_TIMEOUT_SECS,
        };

        let mut enabled_sources = Vec::new();
        for name in var("SCHOLAR_HUB_SOURCES").unwrap_or_default().split(',') {
            if name.trim().is_empty() {
                continue;
            }
            match name.parse::<Source>() {
                Ok(source) if !enabled_sources.contains(&source) => enabled_sources.push(source),
                Ok(_) => {}
                Err(e) => tracing::warn!("SCHOLAR_HUB_SOURCES: {}", e),
            }
        }

        let knowledge_dir = data_dir.join("knowledge");
        let knowledge = KnowledgeConfig {
            uri: var("KNOWLEDGE_STORE_URI").unwrap_or_else(|| knowledge_dir.to_string_lossy().into_owned()),
            namespace: var("KNOWLEDGE_STORE_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            database: var("KNOWLEDGE_STORE_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            access_key: var("KNOWLEDGE_STORE_ACCESS_KEY"),
            secret_key: var("KNOWLEDGE_STORE_SECRET_KEY"),
            index_dir: knowledge_dir,
        };

        Self {
            data_dir,
            download_dir,
            timeout: Duration::from_secs(timeout_secs),
            enabled_sources,
            semantic_scholar_api_key: var("SEMANTIC_SCHOLAR_API_KEY"),
            pubmed_api_key: var("PUBMED_API_KEY"),
            ncbi_email: var("NCBI_EMAIL"),
            crossref_mailto: var("CROSSREF_MAILTO").unwrap_or_else(|| DEFAULT_CROSSREF_MAILTO.to_string()),
            huggingface_token: var("HUGGINGFACE_TOKEN"),
            searxng_url: var("SEARXNG_URL").unwrap_or_else(|| apis::searxng::DEFAULT_SEARXNG_URL.to_string()),
            scihub_url: var("SCIHUB_URL").unwrap_or_else(|| apis::sci_hub::DEFAULT_SCIHUB_URL.to_string()),
            google_scholar_proxy: var("GOOGLE_SCHOLAR_PROXY"),
            knowledge,
        }
    }

    /// Budget for one façade call. Paginated searches pause between pages,
    /// so this is well above the per-request timeout.
    pub fn call_timeout(&self) -> Duration {
        self.timeout * 10
    }

    pub fn is_enabled(&self, source: Source) -> bool {
        self.enabled_sources.is_empty() || self.enabled_sources.contains(&source)
    }

    /// The HTTP client shared by every adapter except Google Scholar.
    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        apis::build_client(self.timeout, apis::USER_AGENT, None).context("Failed to build HTTP client")
    }

    pub fn crossref_client(&self, client: reqwest::Client) -> apis::crossref::CrossRefClient {
        apis::crossref::CrossRefClient::new(client, self.crossref_mailto.clone())
    }

    /// Build the registry of enabled sources.
    pub fn build_registry(&self, client: &reqwest::Client) -> anyhow::Result<SourceRegistry> {
        let mut registry = SourceRegistry::new();
        for source in Source::ALL {
            if !self.is_enabled(source) {
                tracing::debug!("{} disabled by SCHOLAR_HUB_SOURCES", source);
                continue;
            }
            registry.register(self.build_adapter(source, client)?);
        }
        tracing::info!("Registered {} paper sources", registry.len());
        Ok(registry)
    }

    fn build_adapter(&self, source: Source, client: &reqwest::Client) -> anyhow::Result<Arc<dyn PaperSource>> {
        use apis::biorxiv::{PreprintServer, RxivClient};

        let client = client.clone();
        let adapter: Arc<dyn PaperSource> = match source {
            Source::Arxiv => Arc::new(apis::arxiv::ArxivClient::new(client)),
            Source::Pubmed => Arc::new(apis::pubmed::PubMedClient::new(
                client,
                self.pubmed_api_key.clone(),
                self.ncbi_email.clone(),
            )),
            Source::Biorxiv => Arc::new(RxivClient::new(client, PreprintServer::Biorxiv)),
            Source::Medrxiv => Arc::new(RxivClient::new(client, PreprintServer::Medrxiv)),
            Source::Semantic => Arc::new(apis::semantic_scholar::SemanticScholarClient::new(
                client,
                self.semantic_scholar_api_key.clone(),
            )),
            Source::Crossref => Arc::new(self.crossref_client(client)),
            Source::Iacr => Arc::new(apis::iacr::IacrClient::new(client)),
            Source::GoogleScholar => {
                // Own client: browser user agent and an optional proxy.
                let scholar_client = apis::build_client(
                    self.timeout,
                    apis::BROWSER_USER_AGENT,
                    self.google_scholar_proxy.as_deref(),
                )
                .context("Failed to build Google Scholar HTTP client")?;
                Arc::new(apis::google_scholar::GoogleScholarClient::new(scholar_client))
            }
            Source::Searxng => Arc::new(apis::searxng::SearxngClient::new(client, &self.searxng_url)),
            Source::SciHub => Arc::new(apis::sci_hub::SciHubClient::new(client, &self.scihub_url)),
            Source::Huggingface => Arc::new(apis::huggingface::HuggingFaceClient::new(
                client,
                self.huggingface_token.clone(),
            )),
        };
        Ok(adapter)
    }

    /// One entry per known source, registered or not.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        Source::ALL
            .into_iter()
            .map(|source| {
                let enabled = self.is_enabled(source);
                let note = if !enabled {
                    "Disabled by SCHOLAR_HUB_SOURCES filter".to_string()
                } else {
                    self.source_note(source)
                };
                SourceStatus {
                    name: source.as_str().to_string(),
                    description: source.description().to_string(),
                    enabled,
                    capabilities: capabilities_of(source),
                    note,
                }
            })
            .collect()
    }

    fn source_note(&self, source: Source) -> String {
        let key_note = |set: bool, missing: &str| {
            if set { "API key set".to_string() } else { missing.to_string() }
        };
        match source {
            Source::Semantic => key_note(self.semantic_scholar_api_key.is_some(), "No API key (rate limited)"),
            Source::Pubmed => key_note(self.pubmed_api_key.is_some(), "No API key (3 requests/second)"),
            Source::Crossref => format!("Polite pool as {}", self.crossref_mailto),
            Source::Huggingface => {
                if self.huggingface_token.is_some() { "Token set".into() } else { "Anonymous access".into() }
            }
            Source::GoogleScholar => match &self.google_scholar_proxy {
                Some(_) => "HTML scraping through proxy".into(),
                None => "HTML scraping (may be CAPTCHA-blocked)".into(),
            },
            Source::Searxng => format!("Instance at {}", self.searxng_url),
            Source::SciHub => format!("Mirror at {}", self.scihub_url),
            Source::Iacr => "HTML scraping".into(),
            Source::Arxiv | Source::Biorxiv | Source::Medrxiv => "No API key required".into(),
        }
    }
}

/// Capabilities without building the adapter; matches what each adapter reports.
fn capabilities_of(source: Source) -> Capabilities {
    match source {
        Source::Pubmed | Source::Crossref | Source::GoogleScholar | Source::Searxng => Capabilities::SEARCH_ONLY,
        _ => Capabilities::FULL_TEXT,
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub capabilities: Capabilities,
    pub note: String,
}

fn home_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/ada")]);
        assert_eq!(cfg.data_dir, PathBuf::from("/home/ada/.scholar-hub"));
        assert_eq!(cfg.download_dir, PathBuf::from("./downloads"));
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.call_timeout(), Duration::from_secs(300));
        assert!(cfg.enabled_sources.is_empty());
        assert_eq!(cfg.crossref_mailto, "paper-search@example.org");
        assert_eq!(cfg.searxng_url, "http://localhost:8080");
        assert_eq!(cfg.scihub_url, "https://sci-hub.se");
        assert_eq!(cfg.knowledge.uri, "/home/ada/.scholar-hub/knowledge");
        assert_eq!(cfg.knowledge.table_prefix(), "research_papers");
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("SCHOLAR_HUB_DATA_DIR", "/data"),
            ("SCHOLAR_HUB_TIMEOUT_SECS", "5"),
            ("SEMANTIC_SCHOLAR_API_KEY", "s2-key"),
            ("PUBMED_API_KEY", "  "),
            ("KNOWLEDGE_STORE_URI", "s3://bucket/kb"),
            ("KNOWLEDGE_STORE_NAMESPACE", "lab"),
            ("KNOWLEDGE_STORE_ACCESS_KEY", "AK"),
        ]);
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.semantic_scholar_api_key.as_deref(), Some("s2-key"));
        assert!(cfg.pubmed_api_key.is_none());
        assert!(cfg.knowledge.is_remote());
        assert_eq!(cfg.knowledge.table_prefix(), "lab_papers");
        assert_eq!(cfg.knowledge.access_key.as_deref(), Some("AK"));
        assert_eq!(cfg.knowledge.index_dir, PathBuf::from("/data/knowledge"));
    }

    #[test]
    fn test_invalid_timeout_falls_back() {
        assert_eq!(config(&[("SCHOLAR_HUB_TIMEOUT_SECS", "soon")]).timeout, Duration::from_secs(30));
        assert_eq!(config(&[("SCHOLAR_HUB_TIMEOUT_SECS", "0")]).timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_source_filter() {
        let cfg = config(&[("SCHOLAR_HUB_SOURCES", "arxiv, Semantic-Scholar,bogus,arxiv")]);
        assert_eq!(cfg.enabled_sources, vec![Source::Arxiv, Source::Semantic]);

        let registry = cfg.build_registry(&reqwest::Client::new()).unwrap();
        let sources: Vec<Source> = registry.sources().collect();
        assert_eq!(sources, vec![Source::Arxiv, Source::Semantic]);

        let status = cfg.source_status();
        assert_eq!(status.len(), Source::ALL.len());
        let pubmed = status.iter().find(|s| s.name == "pubmed").unwrap();
        assert!(!pubmed.enabled);
        assert!(pubmed.note.contains("SCHOLAR_HUB_SOURCES"));
    }

    #[test]
    fn test_full_registry_matches_status_capabilities() {
        let cfg = config(&[]);
        let registry = cfg.build_registry(&reqwest::Client::new()).unwrap();
        assert_eq!(registry.len(), Source::ALL.len());
        for adapter in registry.adapters() {
            assert_eq!(adapter.capabilities(), capabilities_of(adapter.source()), "{}", adapter.source());
        }
    }
}
