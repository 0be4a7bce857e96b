//! # runbook-kernel
//!
//! Block coordination engine for runbook documents.
//!
//! A document is an ordered list of blocks, each with a dependency rule. The
//! kernel decides when a block may run, routes run/stop intents to whatever
//! executes blocks, shares remote sessions between blocks, and ranks
//! documents for search.
//!
//! - [`resolver`]: eligibility and build order, with cycle detection
//! - [`control`]: run/stop signal fan-out to executors
//! - [`coordinator`]: run states, single-block and whole-document runs
//! - [`connections`]: ref-counted remote session records
//! - [`fuzzy`]: approximate matching with highlight positions
//! - [`search`]: incremental document index
//! - [`engine`]: the bundle of the above with an `open`/`reset` lifecycle

pub mod config;
pub mod connections;
pub mod control;
pub mod coordinator;
pub mod engine;
pub mod fuzzy;
pub mod resolver;
pub mod search;

pub use config::{BusConfig, ConfigError, ConnectionsConfig, EngineConfig, SearchConfig};
pub use connections::{
    ConnectionEvent, ConnectionRecord, ConnectionStatus, ConnectionSubscription, ConnectionTracker,
    RecordId, TrackerError,
};
pub use control::{ControlBus, PublishError, Signal, SignalKind, Unsubscribe};
pub use coordinator::{RunCoordinator, RunError, RunEvent};
pub use engine::Engine;
pub use fuzzy::{FuzzyMatch, FuzzyScore, MatchRange, fuzzy_match, score_fuzzy};
pub use resolver::{DependencyError, DependencyGraph, Resolver, RunStates, build_order};
pub use search::{SearchDocument, SearchHit, SearchIndex};

pub use runbook_types;
