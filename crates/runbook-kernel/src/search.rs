//! Incremental search index over documents.
//!
//! Entries are keyed by document id. [`SearchIndex::bulk_update`] merges: an
//! incoming document replaces the entry with the same id and leaves every
//! other entry alone. Each write stamps a monotonic revision used to break
//! score ties in favour of the most recently updated document.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use runbook_types::Document;

use crate::config::SearchConfig;
use crate::fuzzy::{self, MatchRange};

/// Searchable projection of a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content_tokens: Vec<String>,
}

impl SearchDocument {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content_tokens: Vec::new(),
        }
    }

    pub fn with_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Derive tokens from block names and payload text, deduplicated in first
    /// seen order.
    pub fn from_document(id: impl Into<String>, title: impl Into<String>, document: &Document) -> Self {
        let mut tokens: Vec<String> = Vec::new();
        for block in document.iter() {
            for word in block.search_text().into_iter().flat_map(str::split_whitespace) {
                if !tokens.iter().any(|t| t == word) {
                    tokens.push(word.to_string());
                }
            }
        }
        Self::new(id, title).with_tokens(tokens)
    }
}

/// One ranked result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub score: u32,
    /// Highlight ranges in the title; empty for content-only hits.
    pub title_matches: Vec<MatchRange>,
    /// Matched via content tokens rather than the title.
    pub matched_content: bool,
}

struct Entry {
    document: SearchDocument,
    revision: u64,
}

pub struct SearchIndex {
    entries: DashMap<String, Entry>,
    revision: AtomicU64,
    config: SearchConfig,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new(SearchConfig::default())
    }
}

impl SearchIndex {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            entries: DashMap::new(),
            revision: AtomicU64::new(0),
            config,
        }
    }

    /// Insert or overwrite one document.
    pub fn update(&self, document: SearchDocument) {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.insert(document.id.clone(), Entry { document, revision });
    }

    /// Merge a batch. Returns how many documents were written.
    pub fn bulk_update(&self, documents: impl IntoIterator<Item = SearchDocument>) -> usize {
        let mut written = 0;
        for document in documents {
            self.update(document);
            written += 1;
        }
        tracing::debug!(written, total = self.entries.len(), "search index updated");
        written
    }

    pub fn remove(&self, id: &str) -> Option<SearchDocument> {
        self.entries.remove(id).map(|(_, e)| e.document)
    }

    pub fn get(&self, id: &str) -> Option<SearchDocument> {
        self.entries.get(id).map(|e| e.document.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Rank indexed documents against `text`.
    ///
    /// Zero-score documents are dropped. Order is score descending, then most
    /// recent update, then id.
    pub fn query(&self, text: &str) -> Vec<SearchHit> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        let mut ranked: Vec<(u64, SearchHit)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let hit = self.score_document(&entry.document, text)?;
                Some((entry.revision, hit))
            })
            .collect();

        ranked.sort_by(|(rev_a, a), (rev_b, b)| {
            b.score
                .cmp(&a.score)
                .then_with(|| rev_b.cmp(rev_a))
                .then_with(|| a.id.cmp(&b.id))
        });

        let limit = self.config.max_results.unwrap_or(usize::MAX);
        ranked.into_iter().take(limit).map(|(_, hit)| hit).collect()
    }

    fn score_document(&self, document: &SearchDocument, text: &str) -> Option<SearchHit> {
        if let Some(m) = fuzzy::fuzzy_match(text, &document.title, true) {
            return Some(SearchHit {
                id: document.id.clone(),
                title: document.title.clone(),
                score: m.score,
                title_matches: m.matches,
                matched_content: false,
            });
        }

        if !self.config.include_content {
            return None;
        }
        let best = document
            .content_tokens
            .iter()
            .map(|token| fuzzy::score_fuzzy(token, text, true).score)
            .max()
            .filter(|score| *score > 0)?;
        Some(SearchHit {
            id: document.id.clone(),
            title: document.title.clone(),
            score: best,
            title_matches: Vec::new(),
            matched_content: true,
        })
    }
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbook_types::{Block, HttpBlock, ScriptBlock};

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn test_query_finds_abbreviation() {
        let index = SearchIndex::default();
        index.bulk_update([SearchDocument::new("r1", "Deploy Service")]);
        let hits = index.query("dply");
        assert_eq!(ids(&hits), vec!["r1"]);
        assert!(hits[0].score > 0);
        assert!(!hits[0].matched_content);
        assert_eq!(hits[0].title_matches[0], MatchRange { start: 0, end: 1 });
    }

    #[test]
    fn test_bulk_update_merges_per_id() {
        let index = SearchIndex::default();
        index.bulk_update([
            SearchDocument::new("a", "Alpha"),
            SearchDocument::new("b", "Beta"),
        ]);
        index.bulk_update([SearchDocument::new("a", "Aleph")]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("a").unwrap().title, "Aleph");
        assert_eq!(index.get("b").unwrap().title, "Beta");
    }

    #[test]
    fn test_ties_prefer_recent_update() {
        let index = SearchIndex::default();
        index.bulk_update([
            SearchDocument::new("b", "Restart"),
            SearchDocument::new("a", "Restart"),
        ]);
        // Same score; "a" was written last.
        assert_eq!(ids(&index.query("restart")), vec!["a", "b"]);

        index.update(SearchDocument::new("b", "Restart"));
        assert_eq!(ids(&index.query("restart")), vec!["b", "a"]);
    }

    #[test]
    fn test_higher_score_first() {
        let index = SearchIndex::default();
        index.bulk_update([
            SearchDocument::new("weak", "my deploy"),
            SearchDocument::new("strong", "deploy"),
            SearchDocument::new("none", "rollback"),
        ]);
        assert_eq!(ids(&index.query("deploy")), vec!["strong", "weak"]);
    }

    #[test]
    fn test_content_fallback() {
        let index = SearchIndex::default();
        index.update(SearchDocument::new("r1", "Nightly").with_tokens(["pg_dump", "rsync"]));
        let hits = index.query("rsync");
        assert_eq!(ids(&hits), vec!["r1"]);
        assert!(hits[0].matched_content);
        assert!(hits[0].title_matches.is_empty());

        let titles_only = SearchIndex::new(SearchConfig {
            include_content: false,
            max_results: None,
        });
        titles_only.update(SearchDocument::new("r1", "Nightly").with_tokens(["rsync"]));
        assert!(titles_only.query("rsync").is_empty());
    }

    #[test]
    fn test_max_results() {
        let index = SearchIndex::new(SearchConfig {
            include_content: true,
            max_results: Some(2),
        });
        index.bulk_update((0..5).map(|i| SearchDocument::new(format!("d{i}"), "deploy")));
        assert_eq!(index.query("deploy").len(), 2);
    }

    #[test]
    fn test_empty_query() {
        let index = SearchIndex::default();
        index.update(SearchDocument::new("a", "anything"));
        assert!(index.query("").is_empty());
        assert!(index.query("   ").is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let index = SearchIndex::default();
        index.bulk_update([SearchDocument::new("a", "x"), SearchDocument::new("b", "y")]);
        assert_eq!(index.remove("a").map(|d| d.title), Some("x".into()));
        assert!(index.remove("a").is_none());
        index.clear();
        assert!(index.is_empty());
    }

    #[test]
    fn test_from_document_tokens() {
        let doc = Document::from_blocks([
            Block::new("b1", "Restart nginx", ScriptBlock::new("systemctl restart nginx")),
            Block::new("b2", "Health", HttpBlock {
                url: "https://example.com/health".into(),
                ..Default::default()
            }),
        ])
        .unwrap();
        let search = SearchDocument::from_document("r1", "Web ops", &doc);
        assert_eq!(
            search.content_tokens,
            vec![
                "Restart",
                "nginx",
                "systemctl",
                "restart",
                "bash",
                "Health",
                "https://example.com/health",
            ]
        );
    }
}
