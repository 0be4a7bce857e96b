//! runbook command-line front end.
//!
//! Usage:
//!   # Execution order for a document (fails on cycles)
//!   runbook order deploy.json
//!
//!   # Rank documents against a query
//!   runbook search dply deploy.json rollback.json
//!
//!   # Score one string against another, with highlight ranges
//!   runbook match hw HelloWorld
//!
//! Logging goes to stderr; set `RUST_LOG=debug` for more.

mod load;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use runbook_kernel::{DependencyError, Engine, EngineConfig, build_order, fuzzy_match};

use crate::load::load_document;

/// Block coordination engine for runbook documents.
#[derive(Parser, Debug)]
#[command(name = "runbook")]
#[command(about = "Inspect, order, and search runbook documents")]
struct Cli {
    /// Engine config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Fail when a block cannot be decoded instead of skipping it
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the order blocks would run in
    Order {
        document: PathBuf,
    },

    /// Index documents and rank them against a query
    Search {
        query: String,
        #[arg(required = true)]
        documents: Vec<PathBuf>,
    },

    /// Fuzzy-match a query against a single target string
    Match {
        query: String,
        target: String,
        /// Require the query to appear contiguously
        #[arg(long)]
        contiguous: bool,
    },
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Order { document } => order(&document, cli.strict),
        Command::Search { query, documents } => search(Engine::open(config), &query, &documents, cli.strict),
        Command::Match {
            query,
            target,
            contiguous,
        } => {
            match_one(&query, &target, !contiguous);
            Ok(())
        }
    }
}

fn order(path: &Path, strict: bool) -> Result<()> {
    let loaded = load_document(path, strict)?;
    if let Some(summary) = loaded.skipped_summary() {
        eprintln!("{summary}");
    }
    let order = match build_order(&loaded.document) {
        Ok(order) => order,
        Err(DependencyError::Cycle { involved }) => {
            let names: Vec<&str> = involved.iter().map(|id| id.as_str()).collect();
            anyhow::bail!("{}: dependency cycle between {}", loaded.id, names.join(", "));
        }
        Err(e) => return Err(e).with_context(|| format!("cannot order {}", loaded.id)),
    };

    println!("{} ({})", loaded.title, loaded.id);
    for (i, id) in order.iter().enumerate() {
        let Some(block) = loaded.document.get(id.as_str()) else {
            continue;
        };
        println!("{:>3}. {:<12} {:<16} {}", i + 1, id.short(), block.kind().as_str(), block.name);
    }
    Ok(())
}

fn search(engine: Engine, query: &str, paths: &[PathBuf], strict: bool) -> Result<()> {
    for path in paths {
        let loaded = load_document(path, strict)?;
        if let Some(summary) = loaded.skipped_summary() {
            eprintln!("{summary}");
        }
        engine.index_document(&loaded.id, &loaded.title, &loaded.document);
    }
    tracing::debug!(documents = engine.search().len(), "indexed");

    let hits = engine.search().query(query);
    if hits.is_empty() {
        println!("no matches for {query:?}");
        return Ok(());
    }
    for hit in hits {
        let via = if hit.matched_content { " (content)" } else { "" };
        println!("{:>5}  {:<20} {}{}", hit.score, hit.id, hit.title, via);
    }
    Ok(())
}

fn match_one(query: &str, target: &str, allow_non_contiguous: bool) {
    match fuzzy_match(query, target, allow_non_contiguous) {
        Some(m) => {
            let ranges: Vec<String> = m.matches.iter().map(|r| format!("{}..{}", r.start, r.end)).collect();
            println!("score {}  ranges [{}]", m.score, ranges.join(", "));
        }
        None => println!("no match"),
    }
}
