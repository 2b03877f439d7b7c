pub mod fulltext;
mod graph;
mod tables;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::apis::{paper_key, Paper, Source};
pub use graph::concept_id;

pub const DEFAULT_NAMESPACE: &str = "research";
pub const DEFAULT_DATABASE: &str = "papers";

/// Where the knowledge store lives. `uri` is anything LanceDB accepts: a
/// local directory or an object-store URI such as `s3://bucket/prefix`.
/// The Tantivy index always lives on local disk under `index_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeConfig {
    pub uri: String,
    pub namespace: String,
    pub database: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub index_dir: PathBuf,
}

impl KnowledgeConfig {
    /// A store entirely inside one local directory.
    pub fn local(dir: &Path) -> Self {
        Self {
            uri: dir.to_string_lossy().into_owned(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            access_key: None,
            secret_key: None,
            index_dir: dir.to_path_buf(),
        }
    }

    pub fn table_prefix(&self) -> String {
        format!("{}_{}", self.namespace, self.database)
    }

    pub fn is_remote(&self) -> bool {
        self.uri.contains("://") && !self.uri.starts_with("file://")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Directed concept → paper edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub concept_id: String,
    pub paper_key: String,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarPaper {
    pub paper: Paper,
    pub score: f64,
    /// Names of the concepts both papers are linked to.
    pub shared_concepts: Vec<String>,
}

/// A concept as seen from one paper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedConcept {
    #[serde(flatten)]
    pub concept: Concept,
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KnowledgeStats {
    pub papers: usize,
    pub concepts: usize,
    pub relationships: usize,
}

/// Persistent papers, concepts and weighted concept → paper relations,
/// with BM25 search over the stored papers.
pub struct KnowledgeStore {
    tables: tables::Tables,
    fulltext: fulltext::FulltextIndex,
}

impl KnowledgeStore {
    pub async fn open(config: &KnowledgeConfig) -> Result<Self> {
        if !config.is_remote() {
            let local = config.uri.strip_prefix("file://").unwrap_or(&config.uri);
            std::fs::create_dir_all(local)
                .with_context(|| format!("Failed to create knowledge store directory {}", local))?;
        }
        let tables = tables::Tables::connect(config).await?;

        let index_path = config.index_dir.join(format!("{}_fulltext", config.table_prefix()));
        let fulltext = fulltext::FulltextIndex::create_or_open(&index_path)
            .context("Failed to open knowledge full-text index")?;

        let mut store = Self { tables, fulltext };
        store.sync_fulltext().await?;
        tracing::info!(uri = %config.uri, prefix = %config.table_prefix(), "Knowledge store ready");
        Ok(store)
    }

    /// Rebuild the local index when it disagrees with the tables, e.g. a
    /// remote store opened from a fresh machine.
    async fn sync_fulltext(&mut self) -> Result<()> {
        let stored = self.tables.count_papers().await?;
        if self.fulltext.count() as usize == stored {
            return Ok(());
        }
        tracing::info!(papers = stored, "Rebuilding knowledge full-text index");
        self.fulltext.clear()?;
        for paper in self.tables.all_papers().await? {
            self.fulltext.index_paper(&paper)?;
        }
        self.fulltext.commit()
    }

    /// Insert or overwrite a paper, keyed by `source:id`. Returns the key.
    pub async fn store_paper(&mut self, paper: &Paper) -> Result<String> {
        if paper.id.trim().is_empty() {
            bail!("Cannot store a paper without an id");
        }
        if paper.title.trim().is_empty() {
            bail!("Cannot store paper {} without a title", paper.key());
        }
        self.tables
            .put_paper(paper)
            .await
            .with_context(|| format!("Failed to store paper {}", paper.key()))?;
        self.fulltext.index_paper(paper)?;
        self.fulltext.commit()?;

        let key = paper.key();
        tracing::info!("Stored paper {}", key);
        Ok(key)
    }

    pub async fn get_paper(&self, source: Source, id: &str) -> Result<Option<Paper>> {
        self.get_paper_by_key(&paper_key(source, id)).await
    }

    pub async fn get_paper_by_key(&self, key: &str) -> Result<Option<Paper>> {
        self.tables.paper(key).await
    }

    /// BM25 over title, abstract and authors of stored papers.
    pub async fn search_papers(&self, query: &str, limit: usize) -> Result<Vec<Paper>> {
        let hits = self.fulltext.search(query, limit)?;
        let keys: Vec<String> = hits.into_iter().map(|(key, _)| key).collect();
        let mut found = self.tables.papers(&keys).await?;
        Ok(keys.iter().filter_map(|key| found.remove(key)).collect())
    }

    /// Create or update the concept derived from `name`.
    pub async fn add_concept(&self, name: &str, description: &str) -> Result<Concept> {
        let Some(id) = concept_id(name) else {
            bail!("Concept name '{}' must contain a letter or digit", name);
        };
        let concept = Concept {
            id,
            name: name.trim().to_string(),
            description: description.trim().to_string(),
        };
        self.tables.put_concept(&concept).await?;
        tracing::info!("Stored concept {}", concept.id);
        Ok(concept)
    }

    pub async fn get_concept(&self, concept_id: &str) -> Result<Option<Concept>> {
        self.tables.concept(concept_id).await
    }

    /// Link a concept to a stored paper. Re-relating the same pair replaces
    /// the strength.
    pub async fn relate(&self, concept_id: &str, paper_key: &str, strength: f64) -> Result<Relation> {
        if !(0.0..=1.0).contains(&strength) {
            bail!("Relation strength must be between 0.0 and 1.0, got {}", strength);
        }
        if self.tables.concept(concept_id).await?.is_none() {
            bail!("Concept '{}' does not exist", concept_id);
        }
        if self.tables.paper(paper_key).await?.is_none() {
            bail!("Paper '{}' is not in the knowledge store", paper_key);
        }
        let relation = Relation {
            concept_id: concept_id.to_string(),
            paper_key: paper_key.to_string(),
            strength,
        };
        self.tables.put_relation(&relation).await?;
        tracing::debug!(strength, "Related {} -> {}", concept_id, paper_key);
        Ok(relation)
    }

    /// Concepts linked to a paper, strongest first.
    pub async fn concepts_for_paper(&self, paper_key: &str) -> Result<Vec<LinkedConcept>> {
        let relations = self.tables.relations_for_paper(paper_key).await?;
        let ids: Vec<String> = relations.iter().map(|r| r.concept_id.clone()).collect();
        let mut concepts = self.tables.concepts(&ids).await?;

        let mut linked: Vec<LinkedConcept> = relations
            .into_iter()
            .filter_map(|r| {
                concepts
                    .remove(&r.concept_id)
                    .map(|concept| LinkedConcept { concept, strength: r.strength })
            })
            .collect();
        linked.sort_by(|a, b| {
            b.strength
                .total_cmp(&a.strength)
                .then_with(|| a.concept.name.cmp(&b.concept.name))
        });
        Ok(linked)
    }

    /// Papers sharing concepts with `paper_key`, ranked by concept overlap.
    pub async fn similar_papers(&self, paper_key: &str, top_k: usize) -> Result<Vec<SimilarPaper>> {
        if self.tables.paper(paper_key).await?.is_none() {
            bail!("Paper '{}' is not in the knowledge store", paper_key);
        }
        let target = self.tables.relations_for_paper(paper_key).await?;
        if target.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let concept_ids: Vec<String> = target.iter().map(|r| r.concept_id.clone()).collect();
        let others = self.tables.relations_for_concepts(&concept_ids).await?;
        let candidates = graph::score_candidates(paper_key, &target, &others);

        let keys: Vec<String> = candidates.iter().map(|c| c.key.clone()).collect();
        let mut papers = self.tables.papers(&keys).await?;
        let names = self.tables.concepts(&concept_ids).await?;

        let similar = candidates
            .into_iter()
            .filter_map(|c| {
                let paper = papers.remove(&c.key)?;
                let shared_concepts = c
                    .shared_concepts
                    .iter()
                    .map(|id| names.get(id).map(|n| n.name.clone()).unwrap_or_else(|| id.clone()))
                    .collect();
                Some(SimilarPaper { paper, score: c.score, shared_concepts })
            })
            .collect();
        Ok(graph::rank(similar, top_k))
    }

    pub async fn stats(&self) -> Result<KnowledgeStats> {
        Ok(KnowledgeStats {
            papers: self.tables.count_papers().await?,
            concepts: self.tables.count_concepts().await?,
            relationships: self.tables.count_relations().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn sample_paper(source: Source, id: &str, title: &str, date: Option<(i32, u32, u32)>) -> Paper {
        let mut paper = Paper::new(source, id, title);
        paper.abstract_text = format!("Abstract of {}", title);
        paper.authors = vec!["Ada Lovelace".to_string(), "Alan Turing".to_string()];
        paper.doi = Some(format!("10.1234/{}", id));
        paper.published_date = date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d));
        paper.url = Some(format!("https://example.org/{}", id));
        paper.pdf_url = Some(format!("https://example.org/{}.pdf", id));
        paper.with_extra("citations", 42).with_extra("categories", vec!["cs.LG"])
    }

    async fn open(dir: &TempDir) -> KnowledgeStore {
        KnowledgeStore::open(&KnowledgeConfig::local(dir.path())).await.unwrap()
    }

    #[tokio::test]
    async fn test_store_and_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut store = open(&tmp).await;

        let paper = sample_paper(Source::Arxiv, "2106.09685", "Low-Rank Adaptation", Some((2021, 6, 17)));
        let key = store.store_paper(&paper).await.unwrap();
        assert_eq!(key, "arxiv:2106.09685");

        let got = store.get_paper(Source::Arxiv, "2106.09685").await.unwrap().unwrap();
        assert_eq!(got, paper);
        assert!(store.get_paper(Source::Pubmed, "2106.09685").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_overwrites() {
        let tmp = TempDir::new().unwrap();
        let mut store = open(&tmp).await;

        let mut paper = sample_paper(Source::Crossref, "10.1/x", "Graph coloring heuristics", None);
        store.store_paper(&paper).await.unwrap();
        paper.title = "Lattice reduction survey".to_string();
        paper.abstract_text.clear();
        store.store_paper(&paper).await.unwrap();

        assert_eq!(store.stats().await.unwrap().papers, 1);
        let got = store.get_paper_by_key("crossref:10.1/x").await.unwrap().unwrap();
        assert_eq!(got.title, "Lattice reduction survey");
        assert!(store.search_papers("coloring", 10).await.unwrap().is_empty());
        assert_eq!(store.search_papers("lattice", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_rejects_blank_paper() {
        let tmp = TempDir::new().unwrap();
        let mut store = open(&tmp).await;
        assert!(store.store_paper(&Paper::new(Source::Arxiv, "", "t")).await.is_err());
        assert!(store.store_paper(&Paper::new(Source::Arxiv, "1", " ")).await.is_err());
    }

    #[tokio::test]
    async fn test_search_papers() {
        let tmp = TempDir::new().unwrap();
        let mut store = open(&tmp).await;
        store
            .store_paper(&sample_paper(Source::Arxiv, "1", "Holographic entanglement entropy", None))
            .await
            .unwrap();
        store
            .store_paper(&sample_paper(Source::Pubmed, "2", "CRISPR gene editing in mice", None))
            .await
            .unwrap();

        let hits = store.search_papers("crispr", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key(), "pubmed:2");
        // Both papers share authors
        assert_eq!(store.search_papers("Turing", 10).await.unwrap().len(), 2);
        assert_eq!(store.search_papers("Turing", 1).await.unwrap().len(), 1);
        assert!(store.search_papers("", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concepts_and_relations() {
        let tmp = TempDir::new().unwrap();
        let mut store = open(&tmp).await;
        let key = store
            .store_paper(&sample_paper(Source::Arxiv, "1", "Attention is all you need", None))
            .await
            .unwrap();

        let concept = store.add_concept("Self Attention", "Token mixing by attention").await.unwrap();
        assert_eq!(concept.id, "concept:self-attention");
        // Same name upserts
        let again = store.add_concept("self attention", "Updated").await.unwrap();
        assert_eq!(again.id, concept.id);
        assert_eq!(store.get_concept(&concept.id).await.unwrap().unwrap().description, "Updated");

        assert!(store.relate(&concept.id, &key, 1.5).await.is_err());
        assert!(store.relate(&concept.id, &key, -0.1).await.is_err());
        assert!(store.relate(&concept.id, &key, f64::NAN).await.is_err());
        assert!(store.relate("concept:missing", &key, 0.5).await.is_err());
        assert!(store.relate(&concept.id, "arxiv:missing", 0.5).await.is_err());

        store.relate(&concept.id, &key, 0.4).await.unwrap();
        store.relate(&concept.id, &key, 0.9).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats, KnowledgeStats { papers: 1, concepts: 1, relationships: 1 });

        let linked = store.concepts_for_paper(&key).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].strength, 0.9);
        assert_eq!(linked[0].concept.name, "self attention");

        assert!(store.add_concept("!!!", "").await.is_err());
    }

    #[tokio::test]
    async fn test_similar_papers_ranking() {
        let tmp = TempDir::new().unwrap();
        let mut store = open(&tmp).await;
        let target = store.store_paper(&sample_paper(Source::Arxiv, "t", "Target", None)).await.unwrap();
        let strong = store.store_paper(&sample_paper(Source::Arxiv, "s", "Strong", None)).await.unwrap();
        let newer = store
            .store_paper(&sample_paper(Source::Arxiv, "n", "Newer", Some((2024, 1, 1))))
            .await
            .unwrap();
        let older = store
            .store_paper(&sample_paper(Source::Arxiv, "o", "Older", Some((2020, 1, 1))))
            .await
            .unwrap();
        let unrelated = store.store_paper(&sample_paper(Source::Arxiv, "u", "Unrelated", None)).await.unwrap();

        let gnn = store.add_concept("Graph Neural Networks", "").await.unwrap();
        let opt = store.add_concept("Optimization", "").await.unwrap();
        let bio = store.add_concept("Biology", "").await.unwrap();

        store.relate(&gnn.id, &target, 1.0).await.unwrap();
        store.relate(&opt.id, &target, 0.5).await.unwrap();
        store.relate(&gnn.id, &strong, 0.8).await.unwrap();
        store.relate(&opt.id, &strong, 0.6).await.unwrap();
        store.relate(&gnn.id, &newer, 0.5).await.unwrap();
        store.relate(&gnn.id, &older, 0.5).await.unwrap();
        store.relate(&bio.id, &unrelated, 1.0).await.unwrap();

        let similar = store.similar_papers(&target, 10).await.unwrap();
        let keys: Vec<String> = similar.iter().map(|s| s.paper.key()).collect();
        assert_eq!(keys, vec![strong.clone(), newer, older]);
        assert!((similar[0].score - (1.0 * 0.8 + 0.5 * 0.6)).abs() < 1e-9);
        assert_eq!(similar[0].shared_concepts, vec!["Graph Neural Networks", "Optimization"]);

        assert_eq!(store.similar_papers(&target, 1).await.unwrap().len(), 1);
        assert!(store.similar_papers(&unrelated, 10).await.unwrap().is_empty());
        assert!(store.similar_papers("arxiv:nope", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let mut store = open(&tmp).await;
            store
                .store_paper(&sample_paper(Source::Iacr, "2023/1234", "Lattice-based signatures", None))
                .await
                .unwrap();
            store.add_concept("Post-quantum", "").await.unwrap();
        }
        let store = open(&tmp).await;
        assert_eq!(store.stats().await.unwrap().concepts, 1);
        assert!(store.get_paper(Source::Iacr, "2023/1234").await.unwrap().is_some());
        assert_eq!(store.search_papers("signatures", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rebuilds_missing_index() {
        let tmp = TempDir::new().unwrap();
        let lance = tmp.path().join("lance");
        let config = KnowledgeConfig {
            uri: lance.to_string_lossy().into_owned(),
            index_dir: tmp.path().join("index-a"),
            ..KnowledgeConfig::local(&lance)
        };
        {
            let mut store = KnowledgeStore::open(&config).await.unwrap();
            store
                .store_paper(&sample_paper(Source::Semantic, "abc", "Protein folding with diffusion", None))
                .await
                .unwrap();
        }
        let fresh_index = KnowledgeConfig { index_dir: tmp.path().join("index-b"), ..config };
        let store = KnowledgeStore::open(&fresh_index).await.unwrap();
        assert_eq!(store.search_papers("protein", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let mut first = open(&tmp).await;
        first.store_paper(&sample_paper(Source::Arxiv, "1", "Only here", None)).await.unwrap();
        drop(first);

        let other = KnowledgeConfig { namespace: "other".into(), ..KnowledgeConfig::local(tmp.path()) };
        let second = KnowledgeStore::open(&other).await.unwrap();
        assert_eq!(second.stats().await.unwrap().papers, 0);
        assert!(second.search_papers("here", 5).await.unwrap().is_empty());
    }
}
