//! Block model: the typed, serializable unit of work in a runbook document.
//!
//! ## Design: envelope + closed payload set
//!
//! Every block shares the same envelope (`id`, `name`, `dependency_spec`) and
//! carries exactly one [`BlockPayload`] variant. The variant set is closed:
//! adding a block type means adding a variant here, a [`BlockKind`]
//! discriminant, and nothing else. On the wire the payload is flattened next to
//! the envelope, discriminated by the `type` field:
//!
//! ```json
//! { "id": "b1", "name": "List files", "dependency_spec": { "kind": "none" },
//!   "type": "script", "code": "ls -la", "interpreter": "bash" }
//! ```
//!
//! Blocks own no external resources. Run state lives with the coordinator,
//! never on the block itself.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::BlockId;

/// A single unit of document-authored work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Unique within the owning document.
    pub id: BlockId,
    /// Human-facing label.
    pub name: String,
    /// Prerequisite rule gating when this block may run.
    pub dependency_spec: DependencySpec,
    /// Variant-specific fields, flattened next to the envelope.
    #[serde(flatten)]
    pub payload: BlockPayload,
}

impl Block {
    /// Create a block with no dependencies.
    pub fn new(id: impl Into<BlockId>, name: impl Into<String>, payload: impl Into<BlockPayload>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependency_spec: DependencySpec::None,
            payload: payload.into(),
        }
    }

    /// Replace the dependency spec.
    pub fn with_dependency(mut self, spec: DependencySpec) -> Self {
        self.dependency_spec = spec;
        self
    }

    /// Replace the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the payload. The variant may change.
    pub fn with_payload(mut self, payload: impl Into<BlockPayload>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn kind(&self) -> BlockKind {
        self.payload.kind()
    }

    /// Remote session key this block needs, if any.
    pub fn connection_key(&self) -> Option<&str> {
        self.payload.connection_key()
    }

    /// Text worth indexing for search: the name plus payload text fields.
    pub fn search_text(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(4);
        if !self.name.is_empty() {
            out.push(self.name.as_str());
        }
        out.extend(self.payload.search_text());
        out
    }
}

/// Prerequisite rule for a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencySpec {
    /// Always eligible.
    #[default]
    None,
    /// Eligible once the immediately preceding block has succeeded.
    Sequential,
    /// Eligible once every named block has reached `outcome`.
    Explicit {
        ids: BTreeSet<BlockId>,
        #[serde(default)]
        outcome: RequiredOutcome,
    },
}

impl DependencySpec {
    /// Explicit dependency on `ids` requiring success.
    pub fn after<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<BlockId>,
    {
        Self::Explicit {
            ids: ids.into_iter().map(Into::into).collect(),
            outcome: RequiredOutcome::Success,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Terminal state an explicit dependency waits for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive, serialize_all = "snake_case")]
pub enum RequiredOutcome {
    /// Prerequisite must have succeeded.
    #[default]
    Success,
    /// Prerequisite must have failed (cleanup / alerting blocks).
    Failure,
    /// Any terminal state will do.
    Finished,
}

impl RequiredOutcome {
    /// Whether `state` satisfies this outcome.
    pub fn is_met_by(&self, state: RunState) -> bool {
        match self {
            Self::Success => state == RunState::Succeeded,
            Self::Failure => state == RunState::Failed,
            Self::Finished => state.is_terminal(),
        }
    }
}

/// Per-block execution state, held by the run coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum RunState {
    #[default]
    Idle,
    Queued,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl RunState {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Stopped => "stopped",
        }
    }

    /// Succeeded, Failed, or Stopped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Stopped)
    }

    /// Queued or Running.
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Queued | RunState::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Discriminant of a block variant, as written in the `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BlockKind {
    Script,
    Terminal,
    SshConnect,
    Http,
    Sql,
    Prometheus,
    Editor,
    LocalDirectory,
}

impl BlockKind {
    /// Every registered variant.
    pub const ALL: [BlockKind; 8] = [
        BlockKind::Script,
        BlockKind::Terminal,
        BlockKind::SshConnect,
        BlockKind::Http,
        BlockKind::Sql,
        BlockKind::Prometheus,
        BlockKind::Editor,
        BlockKind::LocalDirectory,
    ];

    /// Resolve a wire discriminant. `None` for unregistered types.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Script => "script",
            BlockKind::Terminal => "terminal",
            BlockKind::SshConnect => "ssh_connect",
            BlockKind::Http => "http",
            BlockKind::Sql => "sql",
            BlockKind::Prometheus => "prometheus",
            BlockKind::Editor => "editor",
            BlockKind::LocalDirectory => "local_directory",
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Variant-specific block fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockPayload {
    Script(ScriptBlock),
    Terminal(TerminalBlock),
    SshConnect(SshConnectBlock),
    Http(HttpBlock),
    Sql(SqlBlock),
    Prometheus(PrometheusBlock),
    Editor(EditorBlock),
    LocalDirectory(LocalDirectoryBlock),
}

impl BlockPayload {
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::Script(_) => BlockKind::Script,
            Self::Terminal(_) => BlockKind::Terminal,
            Self::SshConnect(_) => BlockKind::SshConnect,
            Self::Http(_) => BlockKind::Http,
            Self::Sql(_) => BlockKind::Sql,
            Self::Prometheus(_) => BlockKind::Prometheus,
            Self::Editor(_) => BlockKind::Editor,
            Self::LocalDirectory(_) => BlockKind::LocalDirectory,
        }
    }

    /// Remote session key (`user@host`) for blocks that open one.
    pub fn connection_key(&self) -> Option<&str> {
        match self {
            Self::SshConnect(b) if !b.user_host.is_empty() => Some(b.user_host.as_str()),
            _ => None,
        }
    }

    /// Free-text fields for the search index.
    pub fn search_text(&self) -> Vec<&str> {
        let fields: Vec<&str> = match self {
            Self::Script(b) => vec![b.code.as_str(), b.interpreter.as_str()],
            Self::Terminal(b) => vec![b.code.as_str()],
            Self::SshConnect(b) => vec![b.user_host.as_str()],
            Self::Http(b) => vec![b.url.as_str(), b.body.as_str()],
            Self::Sql(b) => vec![b.query.as_str()],
            Self::Prometheus(b) => vec![b.query.as_str(), b.endpoint.as_str()],
            Self::Editor(b) => vec![b.code.as_str()],
            Self::LocalDirectory(b) => vec![b.path.as_str()],
        };
        fields.into_iter().filter(|s| !s.is_empty()).collect()
    }
}

/// Script run through an interpreter, optionally captured into a variable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptBlock {
    pub code: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default = "default_true")]
    pub output_visible: bool,
}

impl ScriptBlock {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            interpreter: default_interpreter(),
            output_variable: None,
            output_visible: true,
        }
    }
}

/// Interactive terminal command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalBlock {
    pub code: String,
    #[serde(default = "default_true")]
    pub output_visible: bool,
}

/// Opens (or reuses) a remote session; following blocks run against it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConnectBlock {
    /// Connection key, `user@host[:port]`.
    pub user_host: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
pub enum HttpVerb {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBlock {
    pub url: String,
    #[serde(default)]
    pub verb: HttpVerb,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    Mysql,
    Sqlite,
    Clickhouse,
}

/// Database query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlBlock {
    pub dialect: SqlDialect,
    pub uri: String,
    pub query: String,
    /// Re-run interval in seconds; 0 disables.
    #[serde(default)]
    pub auto_refresh: u32,
}

/// Metrics query against a Prometheus endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusBlock {
    pub endpoint: String,
    pub query: String,
    /// Lookback window, e.g. `"5m"`.
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default)]
    pub auto_refresh: u32,
}

/// Free-form code editor, optionally exported as a template variable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorBlock {
    pub code: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_name: Option<String>,
}

/// Sets the working directory for following local blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDirectoryBlock {
    pub path: String,
}

macro_rules! impl_payload_from {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for BlockPayload {
                fn from(b: $ty) -> Self {
                    BlockPayload::$variant(b)
                }
            }
        )*
    };
}

impl_payload_from! {
    ScriptBlock => Script,
    TerminalBlock => Terminal,
    SshConnectBlock => SshConnect,
    HttpBlock => Http,
    SqlBlock => Sql,
    PrometheusBlock => Prometheus,
    EditorBlock => Editor,
    LocalDirectoryBlock => LocalDirectory,
}

fn default_interpreter() -> String {
    "bash".to_string()
}

fn default_period() -> String {
    "5m".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_terminal() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Stopped.is_terminal());
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Queued.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }

    #[test]
    fn test_run_state_parse() {
        assert_eq!(RunState::from_str("SUCCEEDED"), Some(RunState::Succeeded));
        assert_eq!(RunState::from_str("idle"), Some(RunState::Idle));
        assert_eq!(RunState::from_str("done"), None);
    }

    #[test]
    fn test_required_outcome() {
        assert!(RequiredOutcome::Success.is_met_by(RunState::Succeeded));
        assert!(!RequiredOutcome::Success.is_met_by(RunState::Failed));
        assert!(RequiredOutcome::Failure.is_met_by(RunState::Failed));
        assert!(!RequiredOutcome::Failure.is_met_by(RunState::Stopped));
        assert!(RequiredOutcome::Finished.is_met_by(RunState::Stopped));
        assert!(!RequiredOutcome::Finished.is_met_by(RunState::Running));
    }

    #[test]
    fn test_block_kind_roundtrip_strings() {
        for kind in BlockKind::ALL {
            assert_eq!(BlockKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(BlockKind::from_str("notebook"), None);
    }

    #[test]
    fn test_block_kind_matches_payload_tag() {
        let block = Block::new("b1", "ssh", SshConnectBlock { user_host: "root@db".into() });
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], block.kind().as_str());
    }

    #[test]
    fn test_envelope_is_flat() {
        let block = Block::new("b1", "List", ScriptBlock::new("ls"))
            .with_dependency(DependencySpec::Sequential);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["id"], "b1");
        assert_eq!(json["name"], "List");
        assert_eq!(json["dependency_spec"]["kind"], "sequential");
        assert_eq!(json["type"], "script");
        assert_eq!(json["code"], "ls");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_connection_key() {
        let ssh = Block::new("b1", "", SshConnectBlock { user_host: "me@box".into() });
        assert_eq!(ssh.connection_key(), Some("me@box"));

        let empty = Block::new("b2", "", SshConnectBlock::default());
        assert_eq!(empty.connection_key(), None);

        let script = Block::new("b3", "", ScriptBlock::new("ls"));
        assert_eq!(script.connection_key(), None);
    }

    #[test]
    fn test_search_text_skips_empty() {
        let block = Block::new("b1", "Fetch", HttpBlock {
            url: "https://example.com".into(),
            ..Default::default()
        });
        assert_eq!(block.search_text(), vec!["Fetch", "https://example.com"]);
    }

    #[test]
    fn test_dependency_after_builds_set() {
        let spec = DependencySpec::after(["b", "a", "b"]);
        match spec {
            DependencySpec::Explicit { ids, outcome } => {
                assert_eq!(ids.len(), 2);
                assert_eq!(outcome, RequiredOutcome::Success);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_explicit_outcome_defaults_to_success() {
        let spec: DependencySpec =
            serde_json::from_str(r#"{"kind":"explicit","ids":["a"]}"#).unwrap();
        assert_eq!(spec, DependencySpec::after(["a"]));
    }

    #[test]
    fn test_with_payload_changes_kind() {
        let block = Block::new("b1", "x", ScriptBlock::new("ls"))
            .with_payload(LocalDirectoryBlock { path: "/tmp".into() });
        assert_eq!(block.kind(), BlockKind::LocalDirectory);
    }
}
