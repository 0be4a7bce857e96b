//! The engine: one explicitly constructed bundle of services.
//!
//! Nothing in the kernel is process-global. Each [`Engine`] owns its own bus,
//! connection tracker, and search index, so tests (or several open
//! workspaces) never share state.

use std::sync::Arc;

use runbook_types::Document;

use crate::config::EngineConfig;
use crate::connections::ConnectionTracker;
use crate::control::ControlBus;
use crate::coordinator::RunCoordinator;
use crate::search::{SearchDocument, SearchIndex};

/// Service bundle with an `open`/`reset` lifecycle. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Engine {
    config: EngineConfig,
    bus: ControlBus,
    connections: ConnectionTracker,
    search: Arc<SearchIndex>,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Self {
        tracing::debug!(
            grace_ms = config.connections.grace_ms,
            include_content = config.search.include_content,
            "engine opened"
        );
        Self {
            bus: ControlBus::new(),
            connections: ConnectionTracker::new(config.connections.grace()),
            search: Arc::new(SearchIndex::new(config.search.clone())),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &ControlBus {
        &self.bus
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn search(&self) -> &SearchIndex {
        &self.search
    }

    /// A coordinator for `document`, signalling through this engine's bus.
    pub fn coordinator(&self, document: Document) -> Arc<RunCoordinator> {
        Arc::new(RunCoordinator::new(
            document,
            self.bus.clone(),
            self.config.bus.event_capacity,
        ))
    }

    /// Index (or re-index) a document for search.
    pub fn index_document(&self, id: &str, title: &str, document: &Document) {
        self.search.update(SearchDocument::from_document(id, title, document));
    }

    /// Drop every subscription, connection record, and index entry.
    pub fn reset(&self) {
        self.bus.reset();
        self.connections.reset();
        self.search.clear();
        tracing::info!("engine reset");
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::open(EngineConfig::default())
    }
}
