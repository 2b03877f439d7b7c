use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::apis::{Paper, SearchFilters};
use crate::config::Config;
use crate::documents;
use crate::knowledge::KnowledgeStore;
use crate::search::PaperSearch;

const READ_PREVIEW_CHARS: usize = 1000;
const PDF_PREVIEW_CHARS: usize = 2000;

/// Search, download and read academic papers across many sources.
#[derive(Parser, Debug)]
#[command(name = "scholar-hub", version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level regardless of RUST_LOG
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the MCP server on stdio (the default)
    Serve,

    /// Search one source
    Search {
        /// Search query (a category for biorxiv/medrxiv, an identifier for sci_hub)
        query: String,

        /// Source to search
        #[arg(long, short, default_value = "arxiv")]
        source: String,

        /// Maximum number of results
        #[arg(long, short, default_value_t = 10)]
        max_results: u32,

        /// Year filter (e.g. "2020", "2018-2022", "2010-", "-2015")
        #[arg(long)]
        year: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a paper's PDF
    Download {
        /// Paper identifier as printed by `search`
        paper_id: String,

        #[arg(long, short, default_value = "arxiv")]
        source: String,

        /// Output directory (default: SCHOLAR_HUB_DOWNLOAD_DIR or ./downloads)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Download a paper and print its text
    Read {
        paper_id: String,

        #[arg(long, short, default_value = "arxiv")]
        source: String,

        /// Directory holding (or receiving) the PDF
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Print the whole text instead of the first 1000 characters
        #[arg(long)]
        all: bool,
    },

    /// List every source and what it supports
    ListSources,

    /// Search a source and store the first hit in the knowledge store
    KnowledgeStore {
        /// Paper id or query
        query: String,

        #[arg(long, short, default_value = "arxiv")]
        source: String,
    },

    /// Keyword search over stored papers
    KnowledgeSearch {
        query: String,

        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },

    /// Show knowledge store counts
    KnowledgeStats,

    /// Extract text and metadata from a local PDF
    ProcessPdf {
        path: PathBuf,

        #[arg(long, short, value_enum, default_value_t = PdfFormat::Markdown)]
        format: PdfFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PdfFormat {
    Markdown,
    Json,
}

impl Cli {
    pub fn is_serve(&self) -> bool {
        matches!(self.command, None | Some(Commands::Serve))
    }
}

fn facade(config: &Config) -> Result<PaperSearch> {
    let http = config.http_client()?;
    let registry = config.build_registry(&http)?;
    Ok(PaperSearch::new(registry, config.call_timeout()))
}

fn preview(text: &str, max_chars: usize) -> (&str, usize) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (&text[..cut], text.chars().count() - max_chars),
        None => (text, 0),
    }
}

fn print_papers(papers: &[Paper], source: &str) {
    if papers.is_empty() {
        println!("No papers found from {}", source);
        return;
    }
    for (i, paper) in papers.iter().enumerate() {
        println!("{}. {}", i + 1, paper.title);
        let mut authors = paper.authors.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
        if paper.authors.len() > 3 {
            authors.push_str(" et al.");
        }
        let date = paper.published_date.map(|d| d.to_string()).unwrap_or_else(|| "n.d.".into());
        println!("   {} | {} | id: {}", authors, date, paper.id);
        if let Some(url) = paper.url.as_ref().or(paper.pdf_url.as_ref()) {
            println!("   {}", url);
        }
    }
    println!("\nFound {} papers", papers.len());
}

/// Run one command. Errors bubble up to `main`, which exits non-zero.
pub async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Serve => crate::server::serve(config).await?,

        Commands::Search { query, source, max_results, year, json } => {
            let search = facade(&config)?;
            let filters = SearchFilters { year, ..Default::default() };
            let papers = search.try_search(&source, &query, max_results, filters).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&papers)?);
            } else {
                print_papers(&papers, &source);
            }
        }

        Commands::Download { paper_id, source, output } => {
            let search = facade(&config)?;
            let dir = output.unwrap_or_else(|| config.download_dir.clone());
            let path = search.download(&source, &paper_id, &dir).await?;
            println!("Downloaded to: {}", path.display());
        }

        Commands::Read { paper_id, source, output, all } => {
            let search = facade(&config)?;
            let dir = output.unwrap_or_else(|| config.download_dir.clone());
            let text = search.read(&source, &paper_id, &dir).await?;
            if text.trim().is_empty() {
                println!("No text extracted from paper");
                return Ok(());
            }
            if all {
                println!("{}", text);
            } else {
                let (head, rest) = preview(&text, READ_PREVIEW_CHARS);
                println!("{}", head);
                if rest > 0 {
                    println!("\n... ({} more characters. Use --all to see full text)", rest);
                }
            }
            println!("\nTotal length: {} characters", text.chars().count());
        }

        Commands::ListSources => {
            for status in config.source_status() {
                let caps = status.capabilities;
                let mut ops = vec!["search"];
                if caps.download {
                    ops.push("download");
                }
                if caps.read {
                    ops.push("read");
                }
                println!(
                    "{:<15} {:<50} {:<24} {}",
                    status.name,
                    status.description,
                    ops.join(", "),
                    if status.enabled { status.note } else { format!("disabled: {}", status.note) }
                );
            }
        }

        Commands::KnowledgeStore { query, source } => {
            let search = facade(&config)?;
            let papers = search.try_search(&source, &query, 1, SearchFilters::default()).await?;
            let Some(paper) = papers.into_iter().next() else {
                bail!("Paper {} not found on {}", query, source);
            };
            let mut store = KnowledgeStore::open(&config.knowledge).await?;
            let key = store.store_paper(&paper).await?;
            println!("Paper stored with key: {}", key);
        }

        Commands::KnowledgeSearch { query, limit } => {
            let store = KnowledgeStore::open(&config.knowledge).await?;
            let papers = store.search_papers(&query, limit).await?;
            if papers.is_empty() {
                println!("No papers found in the knowledge store");
            } else {
                for paper in &papers {
                    println!("{:<40} {}", paper.key(), paper.title);
                }
                println!("\nFound {} papers", papers.len());
            }
        }

        Commands::KnowledgeStats => {
            let store = KnowledgeStore::open(&config.knowledge).await?;
            let stats = store.stats().await?;
            println!("Knowledge store statistics\n");
            println!("  Papers:        {}", stats.papers);
            println!("  Concepts:      {}", stats.concepts);
            println!("  Relationships: {}", stats.relationships);
        }

        Commands::ProcessPdf { path, format } => {
            if !path.is_file() {
                bail!("No such file: {}", path.display());
            }
            let processed = documents::process_pdf_async(path.clone())
                .await
                .with_context(|| format!("Failed to process {}", path.display()))?;
            match format {
                PdfFormat::Json => println!("{}", serde_json::to_string_pretty(&processed)?),
                PdfFormat::Markdown => {
                    let (head, rest) = preview(&processed.text, PDF_PREVIEW_CHARS);
                    println!("{}", head);
                    if rest > 0 {
                        println!("\n... (truncated)");
                    }
                    let meta = &processed.metadata;
                    println!("\nMetadata:");
                    println!("  pages: {}", meta.pages);
                    println!("  file_size: {}", meta.file_size);
                    for (label, value) in [
                        ("title", &meta.title),
                        ("author", &meta.author),
                        ("subject", &meta.subject),
                        ("creator", &meta.creator),
                        ("producer", &meta.producer),
                    ] {
                        if let Some(value) = value {
                            println!("  {}: {}", label, value);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["scholar-hub"]).unwrap();
        assert!(cli.is_serve());

        let cli = Cli::try_parse_from([
            "scholar-hub", "--debug", "search", "graph neural networks", "--source", "semantic",
            "--max-results", "5", "--year", "2020-",
        ])
        .unwrap();
        assert!(cli.debug);
        match cli.command {
            Some(Commands::Search { query, source, max_results, year, json }) => {
                assert_eq!(query, "graph neural networks");
                assert_eq!(source, "semantic");
                assert_eq!(max_results, 5);
                assert_eq!(year.as_deref(), Some("2020-"));
                assert!(!json);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cli = Cli::try_parse_from(["scholar-hub", "read", "2106.09685", "--all"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Read { all: true, .. })));

        let cli = Cli::try_parse_from(["scholar-hub", "process-pdf", "a.pdf", "--format", "json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::ProcessPdf { format: PdfFormat::Json, .. })));

        assert!(Cli::try_parse_from(["scholar-hub", "process-pdf", "a.pdf", "--format", "html"]).is_err());
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let text = "é".repeat(1500);
        let (head, rest) = preview(&text, 1000);
        assert_eq!(head.chars().count(), 1000);
        assert_eq!(rest, 500);
        assert_eq!(preview("short", 1000), ("short", 0));
    }

    #[tokio::test]
    async fn test_unknown_source_fails() {
        let config = Config::from_lookup(|_| None);
        let err = run(
            Commands::Search {
                query: "x".into(),
                source: "nowhere".into(),
                max_results: 1,
                year: None,
                json: true,
            },
            config,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unknown source"));
    }

    #[tokio::test]
    async fn test_download_from_search_only_source_fails() {
        let config = Config::from_lookup(|_| None);
        let dir = tempfile::TempDir::new().unwrap();
        let err = run(
            Commands::Download {
                paper_id: "12345".into(),
                source: "pubmed".into(),
                output: Some(dir.path().to_path_buf()),
            },
            config,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("pubmed"));
    }
}
