use std::path::Path;
use anyhow::{Context, Result};
use tantivy::{
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::*,
    Index, IndexReader, IndexWriter, ReloadPolicy, Term,
};

use crate::apis::Paper;

/// Tantivy BM25 index over stored papers, keyed by `source:id`.
pub struct FulltextIndex {
    index: Index,
    reader: IndexReader,
    writer: IndexWriter,
    f_key: Field,
    f_title: Field,
    f_abstract: Field,
    f_authors: Field,
}

impl FulltextIndex {
    /// Create or open a Tantivy index at the given directory.
    pub fn create_or_open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .context("Failed to create tantivy index directory")?;

        let mut schema_builder = Schema::builder();
        let f_key = schema_builder.add_text_field("key", STRING | STORED);
        let f_title = schema_builder.add_text_field("title", TEXT);
        let f_abstract = schema_builder.add_text_field("abstract", TEXT);
        let f_authors = schema_builder.add_text_field("authors", TEXT);
        let schema = schema_builder.build();

        let dir = tantivy::directory::MmapDirectory::open(path)
            .context("Failed to open MmapDirectory")?;
        let index = Index::open_or_create(dir, schema)
            .context("Failed to open or create tantivy index")?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create index reader")?;

        let writer = index
            .writer(50_000_000)
            .context("Failed to create index writer")?;

        Ok(Self {
            index,
            reader,
            writer,
            f_key,
            f_title,
            f_abstract,
            f_authors,
        })
    }

    /// Replace the document for this paper's key. Not visible until `commit`.
    pub fn index_paper(&mut self, paper: &Paper) -> Result<()> {
        let key = paper.key();
        self.writer.delete_term(Term::from_field_text(self.f_key, &key));

        let mut doc = doc!(
            self.f_key => key.as_str(),
            self.f_title => paper.title.as_str(),
        );
        if !paper.abstract_text.is_empty() {
            doc.add_text(self.f_abstract, &paper.abstract_text);
        }
        if !paper.authors.is_empty() {
            doc.add_text(self.f_authors, &paper.authors.join(", "));
        }

        self.writer.add_document(doc)
            .context("Failed to add document")?;
        Ok(())
    }

    /// Drop every document, used before a rebuild.
    pub fn clear(&mut self) -> Result<()> {
        self.writer.delete_all_documents().context("Failed to clear index")?;
        Ok(())
    }

    /// Commit pending changes to make them searchable.
    pub fn commit(&mut self) -> Result<()> {
        self.writer.commit().context("Failed to commit")?;
        self.reader.reload().context("Failed to reload reader")?;
        Ok(())
    }

    /// Search title, abstract and authors. Returns (key, score) pairs ranked
    /// by BM25. Query syntax errors are tolerated: the parseable part is used.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(
            &self.index,
            vec![self.f_title, self.f_abstract, self.f_authors],
        );
        let (parsed, errors) = query_parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!(?errors, "Lenient parse of knowledge query '{}'", query);
        }

        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(limit))
            .context("Search failed")?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;
            if let Some(key) = doc.get_first(self.f_key).and_then(|v| v.as_str()) {
                results.push((key.to_string(), score));
            }
        }
        Ok(results)
    }

    /// Get the total number of indexed documents.
    pub fn count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::Source;
    use tempfile::TempDir;

    fn paper(id: &str, title: &str, abstract_text: &str, authors: &[&str]) -> Paper {
        let mut paper = Paper::new(Source::Arxiv, id, title);
        paper.abstract_text = abstract_text.to_string();
        paper.authors = authors.iter().map(|a| a.to_string()).collect();
        paper
    }

    #[test]
    fn test_fulltext_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut idx = FulltextIndex::create_or_open(tmp.path()).unwrap();

        idx.index_paper(&paper(
            "2301.00001",
            "AdS/CFT Correspondence and Holographic Entanglement",
            "We study the entanglement entropy in anti-de Sitter spacetime using holographic methods.",
            &["Alice Physicist", "Bob Theorist"],
        )).unwrap();
        idx.index_paper(&paper(
            "2302.00002",
            "Quantum Error Correction Codes",
            "A review of stabilizer codes and topological quantum error correction.",
            &["Charlie Quantum"],
        )).unwrap();
        idx.commit().unwrap();

        let results = idx.search("holographic entanglement", 10).unwrap();
        assert_eq!(results[0].0, "arxiv:2301.00001");

        let results = idx.search("quantum error correction", 10).unwrap();
        assert_eq!(results[0].0, "arxiv:2302.00002");

        // Authors are searchable too
        let results = idx.search("Charlie", 10).unwrap();
        assert_eq!(results.len(), 1);

        assert_eq!(idx.count(), 2);
    }

    #[test]
    fn test_reindex_replaces_document() {
        let tmp = TempDir::new().unwrap();
        let mut idx = FulltextIndex::create_or_open(tmp.path()).unwrap();
        idx.index_paper(&paper("1", "Old title about graphs", "", &[])).unwrap();
        idx.commit().unwrap();
        idx.index_paper(&paper("1", "New title about lattices", "", &[])).unwrap();
        idx.commit().unwrap();

        assert_eq!(idx.count(), 1);
        assert!(idx.search("graphs", 10).unwrap().is_empty());
        assert_eq!(idx.search("lattices", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_lenient_query_syntax() {
        let tmp = TempDir::new().unwrap();
        let mut idx = FulltextIndex::create_or_open(tmp.path()).unwrap();
        idx.index_paper(&paper("1", "Transformer attention mechanisms", "", &[])).unwrap();
        idx.commit().unwrap();

        // Unknown field clause is dropped
        let results = idx.search("attention nosuchfield:foo", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert!(idx.search("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let tmp = TempDir::new().unwrap();
        let mut idx = FulltextIndex::create_or_open(tmp.path()).unwrap();
        idx.index_paper(&paper("1", "Something", "", &[])).unwrap();
        idx.commit().unwrap();
        idx.clear().unwrap();
        idx.commit().unwrap();
        assert_eq!(idx.count(), 0);
    }
}
