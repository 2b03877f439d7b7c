use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::apis::{Paper, PaperSource, SearchFilters, SearchRequest, Source, SourceError, UnknownSource};

pub const MAX_RESULTS_LIMIT: u32 = 1000;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    UnknownSource(#[from] UnknownSource),
    #[error("source '{0}' is not enabled")]
    Disabled(Source),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("{platform} failed: {cause}")]
    Source {
        platform: Source,
        #[source]
        cause: SourceError,
    },
}

/// Adapters in registration order, one per platform.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn PaperSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter, replacing any earlier one for the same platform.
    pub fn register(&mut self, adapter: Arc<dyn PaperSource>) {
        let source = adapter.source();
        match self.sources.iter_mut().find(|s| s.source() == source) {
            Some(slot) => *slot = adapter,
            None => self.sources.push(adapter),
        }
    }

    pub fn get(&self, source: Source) -> Option<&Arc<dyn PaperSource>> {
        self.sources.iter().find(|s| s.source() == source)
    }

    pub fn sources(&self) -> impl Iterator<Item = Source> + '_ {
        self.sources.iter().map(|s| s.source())
    }

    pub fn adapters(&self) -> &[Arc<dyn PaperSource>] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Routes requests to the registered adapters.
#[derive(Clone)]
pub struct PaperSearch {
    registry: Arc<SourceRegistry>,
    call_timeout: Duration,
}

impl PaperSearch {
    pub fn new(registry: SourceRegistry, call_timeout: Duration) -> Self {
        Self { registry: Arc::new(registry), call_timeout }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn resolve(&self, source_name: &str) -> Result<Arc<dyn PaperSource>, SearchError> {
        let source: Source = source_name.parse()?;
        self.registry
            .get(source)
            .cloned()
            .ok_or(SearchError::Disabled(source))
    }

    fn validate(query: &str, max_results: u32) -> Result<(), SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::InvalidInput("query must not be empty".into()));
        }
        if max_results == 0 || max_results > MAX_RESULTS_LIMIT {
            return Err(SearchError::InvalidInput(format!(
                "max_results must be between 1 and {}, got {}",
                MAX_RESULTS_LIMIT, max_results
            )));
        }
        Ok(())
    }

    /// Search one platform, surfacing adapter failures as `SearchError::Source`.
    pub async fn try_search(
        &self,
        source_name: &str,
        query: &str,
        max_results: u32,
        filters: SearchFilters,
    ) -> Result<Vec<Paper>, SearchError> {
        let adapter = self.resolve(source_name)?;
        Self::validate(query, max_results)?;
        let request = SearchRequest::new(query.trim(), max_results).with_filters(filters);
        run_search(adapter.as_ref(), &request, self.call_timeout)
            .await
            .map_err(|cause| SearchError::Source { platform: adapter.source(), cause })
    }

    /// Search one platform. Argument errors are returned; adapter failures are
    /// logged and yield an empty list.
    pub async fn search(
        &self,
        source_name: &str,
        query: &str,
        max_results: u32,
        filters: SearchFilters,
    ) -> Result<Vec<Paper>, SearchError> {
        match self.try_search(source_name, query, max_results, filters).await {
            Err(SearchError::Source { platform, cause }) => {
                tracing::warn!("Search on {} failed: {}", platform, cause);
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Query several platforms concurrently and concatenate their results in
    /// registry order. A failing platform contributes nothing.
    pub async fn search_all(
        &self,
        query: &str,
        max_per_source: u32,
        sources: Option<&[String]>,
        filters: SearchFilters,
    ) -> Result<Vec<Paper>, SearchError> {
        let selected: Vec<Source> = match sources {
            Some(names) if !names.is_empty() => {
                let wanted = names
                    .iter()
                    .map(|n| n.parse::<Source>())
                    .collect::<Result<Vec<_>, _>>()?;
                self.registry.sources().filter(|s| wanted.contains(s)).collect()
            }
            _ => self.registry.sources().collect(),
        };
        Self::validate(query, max_per_source)?;

        let request = SearchRequest::new(query.trim(), max_per_source).with_filters(filters);
        let handles: Vec<_> = selected
            .iter()
            .filter_map(|source| self.registry.get(*source).cloned())
            .map(|adapter| {
                let request = request.clone();
                let call_timeout = self.call_timeout;
                tokio::spawn(async move {
                    let source = adapter.source();
                    (source, run_search(adapter.as_ref(), &request, call_timeout).await)
                })
            })
            .collect();

        let mut all_results = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(results))) => all_results.extend(results),
                Ok((source, Err(e))) => tracing::warn!("Search on {} failed: {}", source, e),
                Err(e) => tracing::warn!("Source task panicked: {}", e),
            }
        }
        Ok(all_results)
    }

    pub async fn download(&self, source_name: &str, id: &str, dest_dir: &Path) -> Result<PathBuf, SearchError> {
        let adapter = self.resolve(source_name)?;
        let id = non_empty_id(id)?;
        tokio::time::timeout(self.call_timeout, adapter.download(id, dest_dir))
            .await
            .unwrap_or(Err(SourceError::Timeout(self.call_timeout)))
            .map_err(|cause| SearchError::Source { platform: adapter.source(), cause })
    }

    pub async fn read(&self, source_name: &str, id: &str, dest_dir: &Path) -> Result<String, SearchError> {
        let adapter = self.resolve(source_name)?;
        let id = non_empty_id(id)?;
        tokio::time::timeout(self.call_timeout, adapter.read(id, dest_dir))
            .await
            .unwrap_or(Err(SourceError::Timeout(self.call_timeout)))
            .map_err(|cause| SearchError::Source { platform: adapter.source(), cause })
    }
}

fn non_empty_id(id: &str) -> Result<&str, SearchError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(SearchError::InvalidInput("paper id must not be empty".into()));
    }
    Ok(id)
}

async fn run_search(
    adapter: &dyn PaperSource,
    request: &SearchRequest,
    call_timeout: Duration,
) -> Result<Vec<Paper>, SourceError> {
    tracing::debug!(source = %adapter.source(), query = %request.query, "Searching");
    let papers = tokio::time::timeout(call_timeout, adapter.search(request))
        .await
        .map_err(|_| SourceError::Timeout(call_timeout))??;
    Ok(finalize(papers, request.max_results))
}

/// Cap the count and drop records without a title.
fn finalize(papers: Vec<Paper>, max_results: u32) -> Vec<Paper> {
    papers
        .into_iter()
        .filter(|p| !p.title.trim().is_empty())
        .take(max_results as usize)
        .collect()
}
