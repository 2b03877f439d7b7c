use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Float64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::stream::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};

use super::{Concept, KnowledgeConfig, Relation};
use crate::apis::{Paper, Source};

/// SQL string literal for LanceDB filters.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn in_list(values: &[String]) -> String {
    values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(", ")
}

fn papers_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("abstract_text", DataType::Utf8, true),
        Field::new("authors_json", DataType::Utf8, true),
        Field::new("doi", DataType::Utf8, true),
        Field::new("published_date", DataType::Utf8, true),
        Field::new("pdf_url", DataType::Utf8, true),
        Field::new("url", DataType::Utf8, true),
        Field::new("extra_json", DataType::Utf8, true),
        Field::new("stored_at", DataType::Utf8, true),
    ]))
}

fn concepts_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("description", DataType::Utf8, true),
    ]))
}

fn relations_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("concept_id", DataType::Utf8, false),
        Field::new("paper_key", DataType::Utf8, false),
        Field::new("strength", DataType::Float64, false),
    ]))
}

/// The three LanceDB tables behind a knowledge store, named
/// `{namespace}_{database}_papers|concepts|relations`.
pub(crate) struct Tables {
    db: lancedb::Connection,
    papers: String,
    concepts: String,
    relations: String,
}

impl Tables {
    pub async fn connect(config: &KnowledgeConfig) -> Result<Self> {
        let mut builder = lancedb::connect(&config.uri);
        if let Some(key) = &config.access_key {
            builder = builder.storage_option("aws_access_key_id", key.as_str());
        }
        if let Some(secret) = &config.secret_key {
            builder = builder.storage_option("aws_secret_access_key", secret.as_str());
        }
        let db = builder
            .execute()
            .await
            .with_context(|| format!("Failed to connect to LanceDB at {}", config.uri))?;

        let prefix = config.table_prefix();
        let papers = format!("{}_papers", prefix);
        let concepts = format!("{}_concepts", prefix);
        let relations = format!("{}_relations", prefix);

        let existing = db.table_names().execute().await.context("Failed to list tables")?;
        for (name, schema) in [
            (&papers, papers_schema()),
            (&concepts, concepts_schema()),
            (&relations, relations_schema()),
        ] {
            if !existing.contains(name) {
                db.create_empty_table(name.clone(), schema)
                    .execute()
                    .await
                    .with_context(|| format!("Failed to create table {}", name))?;
                tracing::info!("Created knowledge table {}", name);
            }
        }

        Ok(Self { db, papers, concepts, relations })
    }

    async fn table(&self, name: &str) -> Result<lancedb::Table> {
        self.db
            .open_table(name)
            .execute()
            .await
            .with_context(|| format!("Failed to open table {}", name))
    }

    async fn insert(&self, name: &str, schema: SchemaRef, batch: RecordBatch) -> Result<()> {
        let table = self.table(name).await?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(batches))
            .execute()
            .await
            .with_context(|| format!("Failed to insert into {}", name))?;
        Ok(())
    }

    async fn delete(&self, name: &str, filter: &str) -> Result<()> {
        let table = self.table(name).await?;
        table
            .delete(filter)
            .await
            .with_context(|| format!("Failed to delete from {}", name))?;
        Ok(())
    }

    /// Rows matching `filter`. Without an explicit limit every match is
    /// returned; plain queries otherwise stop at LanceDB's default page.
    async fn select(&self, name: &str, filter: Option<String>, limit: Option<usize>) -> Result<Vec<RecordBatch>> {
        let table = self.table(name).await?;
        let limit = match limit {
            Some(limit) => limit,
            None => table
                .count_rows(filter.clone())
                .await
                .with_context(|| format!("Failed to count rows in {}", name))?,
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut query = table.query().limit(limit);
        if let Some(filter) = filter {
            query = query.only_if(filter);
        }
        let mut stream = query
            .execute()
            .await
            .with_context(|| format!("Failed to query {}", name))?;

        let mut batches = Vec::new();
        while let Some(batch) = stream.next().await {
            batches.push(batch.context("Failed to read query result batch")?);
        }
        Ok(batches)
    }

    async fn count(&self, name: &str) -> Result<usize> {
        let table = self.table(name).await?;
        table
            .count_rows(None)
            .await
            .with_context(|| format!("Failed to count rows in {}", name))
    }

    // Papers

    /// Replace any row with the same key, then insert.
    pub async fn put_paper(&self, paper: &Paper) -> Result<()> {
        let key = paper.key();
        let authors_json = serde_json::to_string(&paper.authors).context("Failed to encode authors")?;
        let extra_json = serde_json::to_string(&paper.extra).context("Failed to encode extra fields")?;
        let published = paper.published_date.map(|d| d.to_string());
        let stored_at = chrono::Utc::now().to_rfc3339();

        let schema = papers_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![key.as_str()])),
                Arc::new(StringArray::from(vec![paper.source.as_str()])),
                Arc::new(StringArray::from(vec![paper.id.as_str()])),
                Arc::new(StringArray::from(vec![paper.title.as_str()])),
                Arc::new(StringArray::from(vec![Some(paper.abstract_text.as_str())])),
                Arc::new(StringArray::from(vec![Some(authors_json.as_str())])),
                Arc::new(StringArray::from(vec![paper.doi.as_deref()])),
                Arc::new(StringArray::from(vec![published.as_deref()])),
                Arc::new(StringArray::from(vec![paper.pdf_url.as_deref()])),
                Arc::new(StringArray::from(vec![paper.url.as_deref()])),
                Arc::new(StringArray::from(vec![Some(extra_json.as_str())])),
                Arc::new(StringArray::from(vec![Some(stored_at.as_str())])),
            ],
        )
        .context("Failed to create paper RecordBatch")?;

        self.delete(&self.papers, &format!("key = {}", quote(&key))).await?;
        self.insert(&self.papers, schema, batch).await
    }

    pub async fn paper(&self, key: &str) -> Result<Option<Paper>> {
        let batches = self
            .select(&self.papers, Some(format!("key = {}", quote(key))), Some(1))
            .await?;
        for batch in &batches {
            if batch.num_rows() > 0 {
                return Ok(Some(row_to_paper(batch, 0)?));
            }
        }
        Ok(None)
    }

    pub async fn papers(&self, keys: &[String]) -> Result<HashMap<String, Paper>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let filter = format!("key IN ({})", in_list(keys));
        let mut found = HashMap::new();
        for batch in self.select(&self.papers, Some(filter), None).await? {
            for row in 0..batch.num_rows() {
                let paper = row_to_paper(&batch, row)?;
                found.insert(paper.key(), paper);
            }
        }
        Ok(found)
    }

    pub async fn all_papers(&self) -> Result<Vec<Paper>> {
        let mut papers = Vec::new();
        for batch in self.select(&self.papers, None, None).await? {
            for row in 0..batch.num_rows() {
                papers.push(row_to_paper(&batch, row)?);
            }
        }
        Ok(papers)
    }

    pub async fn count_papers(&self) -> Result<usize> {
        self.count(&self.papers).await
    }

    // Concepts

    pub async fn put_concept(&self, concept: &Concept) -> Result<()> {
        let schema = concepts_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![concept.id.as_str()])),
                Arc::new(StringArray::from(vec![concept.name.as_str()])),
                Arc::new(StringArray::from(vec![Some(concept.description.as_str())])),
            ],
        )
        .context("Failed to create concept RecordBatch")?;

        self.delete(&self.concepts, &format!("id = {}", quote(&concept.id))).await?;
        self.insert(&self.concepts, schema, batch).await
    }

    pub async fn concept(&self, id: &str) -> Result<Option<Concept>> {
        let batches = self
            .select(&self.concepts, Some(format!("id = {}", quote(id))), Some(1))
            .await?;
        for batch in &batches {
            if batch.num_rows() > 0 {
                return row_to_concept(batch, 0).map(Some);
            }
        }
        Ok(None)
    }

    pub async fn concepts(&self, ids: &[String]) -> Result<HashMap<String, Concept>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let filter = format!("id IN ({})", in_list(ids));
        let mut found = HashMap::new();
        for batch in self.select(&self.concepts, Some(filter), None).await? {
            for row in 0..batch.num_rows() {
                let concept = row_to_concept(&batch, row)?;
                found.insert(concept.id.clone(), concept);
            }
        }
        Ok(found)
    }

    pub async fn count_concepts(&self) -> Result<usize> {
        self.count(&self.concepts).await
    }

    // Relations

    pub async fn put_relation(&self, relation: &Relation) -> Result<()> {
        let schema = relations_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![relation.concept_id.as_str()])),
                Arc::new(StringArray::from(vec![relation.paper_key.as_str()])),
                Arc::new(Float64Array::from(vec![relation.strength])),
            ],
        )
        .context("Failed to create relation RecordBatch")?;

        let filter = format!(
            "concept_id = {} AND paper_key = {}",
            quote(&relation.concept_id),
            quote(&relation.paper_key)
        );
        self.delete(&self.relations, &filter).await?;
        self.insert(&self.relations, schema, batch).await
    }

    pub async fn relations_for_paper(&self, paper_key: &str) -> Result<Vec<Relation>> {
        self.relations_where(format!("paper_key = {}", quote(paper_key))).await
    }

    pub async fn relations_for_concepts(&self, concept_ids: &[String]) -> Result<Vec<Relation>> {
        if concept_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.relations_where(format!("concept_id IN ({})", in_list(concept_ids))).await
    }

    async fn relations_where(&self, filter: String) -> Result<Vec<Relation>> {
        let mut relations = Vec::new();
        for batch in self.select(&self.relations, Some(filter), None).await? {
            let strengths = batch
                .column_by_name("strength")
                .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
                .context("Missing strength column")?;
            for row in 0..batch.num_rows() {
                relations.push(Relation {
                    concept_id: required_str(&batch, "concept_id", row)?,
                    paper_key: required_str(&batch, "paper_key", row)?,
                    strength: strengths.value(row),
                });
            }
        }
        Ok(relations)
    }

    pub async fn count_relations(&self) -> Result<usize> {
        self.count(&self.relations).await
    }
}

fn optional_str(batch: &RecordBatch, name: &str, row: usize) -> Option<String> {
    batch
        .column_by_name(name)?
        .as_any()
        .downcast_ref::<StringArray>()
        .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row).to_string()) })
}

fn required_str(batch: &RecordBatch, name: &str, row: usize) -> Result<String> {
    optional_str(batch, name, row).with_context(|| format!("Missing value in column {}", name))
}

fn row_to_paper(batch: &RecordBatch, row: usize) -> Result<Paper> {
    let source: Source = required_str(batch, "source", row)?
        .parse()
        .context("Stored paper has an unknown source")?;
    let mut paper = Paper::new(source, required_str(batch, "id", row)?, required_str(batch, "title", row)?);
    paper.abstract_text = optional_str(batch, "abstract_text", row).unwrap_or_default();
    paper.authors = match optional_str(batch, "authors_json", row) {
        Some(json) => serde_json::from_str(&json).context("Stored authors are not valid JSON")?,
        None => Vec::new(),
    };
    paper.doi = optional_str(batch, "doi", row);
    paper.published_date = match optional_str(batch, "published_date", row) {
        Some(date) => Some(date.parse().with_context(|| format!("Stored date '{}' is invalid", date))?),
        None => None,
    };
    paper.pdf_url = optional_str(batch, "pdf_url", row);
    paper.url = optional_str(batch, "url", row);
    if let Some(json) = optional_str(batch, "extra_json", row) {
        paper.extra = serde_json::from_str(&json).context("Stored extra fields are not valid JSON")?;
    }
    Ok(paper)
}

fn row_to_concept(batch: &RecordBatch, row: usize) -> Result<Concept> {
    Ok(Concept {
        id: required_str(batch, "id", row)?,
        name: required_str(batch, "name", row)?,
        description: optional_str(batch, "description", row).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes_single_quotes() {
        assert_eq!(quote("o'neil"), "'o''neil'");
        assert_eq!(in_list(&["a".into(), "b'c".into()]), "'a', 'b''c'");
    }
}
