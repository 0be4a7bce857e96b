//! Document files on disk.
//!
//! A document file is JSON: `{ "id": ..., "title": ..., "blocks": [ ... ] }`,
//! each block in the persisted block format.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use runbook_types::{BlockDeserializationError, Document, deserialize_value};

#[derive(Deserialize)]
struct DocumentFile {
    id: String,
    title: String,
    #[serde(default)]
    blocks: Vec<Value>,
}

pub struct LoadedDocument {
    pub id: String,
    pub title: String,
    pub document: Document,
    /// Blocks that failed to decode and were left out.
    pub skipped: Vec<BlockDeserializationError>,
}

impl LoadedDocument {
    /// One line naming the blocks left out, if any.
    pub fn skipped_summary(&self) -> Option<String> {
        if self.skipped.is_empty() {
            return None;
        }
        let ids: Vec<&str> = self
            .skipped
            .iter()
            .map(|e| e.block_id().map_or("<no id>", |id| id.as_str()))
            .collect();
        Some(format!(
            "{}: skipped {} undecodable block(s): {}",
            self.id,
            ids.len(),
            ids.join(", ")
        ))
    }
}

/// Read a document file. Undecodable blocks are skipped and logged, or fail
/// the load when `strict`.
pub fn load_document(path: &Path, strict: bool) -> Result<LoadedDocument> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_document(&content, strict).with_context(|| format!("failed to load {}", path.display()))
}

pub fn parse_document(content: &str, strict: bool) -> Result<LoadedDocument> {
    let file: DocumentFile = serde_json::from_str(content).context("not a document file")?;

    let mut blocks = Vec::with_capacity(file.blocks.len());
    let mut skipped = Vec::new();
    for value in file.blocks {
        match deserialize_value(value) {
            Ok(block) => blocks.push(block),
            Err(e) if strict => return Err(e.into()),
            Err(e) => {
                tracing::warn!(document = %file.id, error = %e, "skipping block");
                skipped.push(e);
            }
        }
    }

    let document = Document::from_blocks(blocks)?;
    Ok(LoadedDocument {
        id: file.id,
        title: file.title,
        document,
        skipped,
    })
}
