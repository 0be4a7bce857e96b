//! Block model for runbook.
//!
//! This crate is the leaf of the workspace: block ids, the closed set of block
//! variants, dependency specs, run states, the persistence codec, and the
//! ordered [`Document`]. It has **no internal runbook dependencies**.
//!
//! # Key Types
//!
//! |-------------------------------|---------------------------------------------|
//! | Type                          | Purpose                                     |
//! |-------------------------------|---------------------------------------------|
//! | [`BlockId`]                   | Opaque id, unique within a document         |
//! | [`Block`]                     | Envelope + variant payload                  |
//! | [`BlockPayload`]              | Closed set of block variants                |
//! | [`DependencySpec`]            | None / Sequential / Explicit prerequisites  |
//! | [`RunState`]                  | Idle → Queued → Running → terminal          |
//! | [`Document`]                  | Ordered blocks, unique ids                  |
//! | [`BlockDeserializationError`] | Why a stored record failed to load          |
//! |-------------------------------|---------------------------------------------|

pub mod block;
pub mod codec;
pub mod document;
pub mod ids;

pub use block::{
    Block, BlockKind, BlockPayload, DependencySpec, EditorBlock, HttpBlock, HttpVerb,
    LocalDirectoryBlock, PrometheusBlock, RequiredOutcome, RunState, ScriptBlock, SqlBlock,
    SqlDialect, SshConnectBlock, TerminalBlock,
};
pub use codec::{BlockDeserializationError, deserialize, deserialize_value, serialize};
pub use document::{Document, DocumentError};
pub use ids::BlockId;
