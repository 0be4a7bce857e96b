//! Dependency resolution over a document's blocks.
//!
//! Two questions get answered here:
//!
//! - **Eligibility**: may this block start now, given current run states?
//! - **Order**: in what order can the whole document run, and is that even
//!   possible (no cycles, no dangling references)?
//!
//! Edges point from prerequisite to dependent. `Sequential` contributes an
//! edge from the preceding block; `Explicit` one from each named block. Cycle
//! detection is a three-color DFS over that adjacency, iterative so document
//! size never turns into stack depth.

use std::collections::HashMap;

use runbook_types::{BlockId, DependencySpec, Document, RunState};
use thiserror::Error;

/// Structural and eligibility failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// The dependency relation is not acyclic. Fatal to a whole-document run.
    #[error("dependency cycle between blocks: {}", join_ids(.involved))]
    Cycle { involved: Vec<BlockId> },

    /// The block's prerequisites have not reached their required outcome.
    #[error("block {block} is waiting on: {}", join_ids(.unmet))]
    NotSatisfied { block: BlockId, unmet: Vec<BlockId> },

    #[error("unknown block: {0}")]
    UnknownBlock(BlockId),

    /// An explicit dependency names a block that is not in the document.
    #[error("block {block} depends on missing block(s): {}", join_ids(.missing))]
    UnknownDependency { block: BlockId, missing: Vec<BlockId> },
}

fn join_ids(ids: &[BlockId]) -> String {
    ids.iter().map(BlockId::as_str).collect::<Vec<_>>().join(", ")
}

/// Current run state per block. Missing entries are `Idle`.
#[derive(Clone, Debug, Default)]
pub struct RunStates {
    states: HashMap<BlockId, RunState>,
}

impl RunStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> RunState {
        self.states.get(id).copied().unwrap_or_default()
    }

    /// Record a state, returning the previous one.
    pub fn set(&mut self, id: BlockId, state: RunState) -> RunState {
        self.states.insert(id, state).unwrap_or_default()
    }

    /// Forget everything; all blocks read as `Idle` again.
    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockId, RunState)> {
        self.states.iter().map(|(id, s)| (id, *s))
    }
}

impl<I: Into<BlockId>> FromIterator<(I, RunState)> for RunStates {
    fn from_iter<T: IntoIterator<Item = (I, RunState)>>(iter: T) -> Self {
        Self {
            states: iter.into_iter().map(|(id, s)| (id.into(), s)).collect(),
        }
    }
}

/// Evaluates dependency specs against a document and its run states.
pub struct Resolver<'a> {
    document: &'a Document,
    states: &'a RunStates,
}

impl<'a> Resolver<'a> {
    pub fn new(document: &'a Document, states: &'a RunStates) -> Self {
        Self { document, states }
    }

    /// Whether `id` may start now.
    pub fn eligible(&self, id: &str) -> Result<bool, DependencyError> {
        Ok(self.unmet(id)?.is_empty())
    }

    /// Prerequisites of `id` that have not reached their required outcome.
    ///
    /// Empty means eligible. A `Sequential` first block has no predecessor and
    /// is always eligible.
    pub fn unmet(&self, id: &str) -> Result<Vec<BlockId>, DependencyError> {
        let block = self
            .document
            .get(id)
            .ok_or_else(|| DependencyError::UnknownBlock(BlockId::new(id)))?;

        let unmet = match &block.dependency_spec {
            DependencySpec::None => Vec::new(),
            DependencySpec::Sequential => match self.document.predecessor(id) {
                Some(prev) if self.states.get(prev.id.as_str()) != RunState::Succeeded => {
                    vec![prev.id.clone()]
                }
                _ => Vec::new(),
            },
            DependencySpec::Explicit { ids, outcome } => ids
                .iter()
                .filter(|dep| !outcome.is_met_by(self.states.get(dep.as_str())))
                .cloned()
                .collect(),
        };
        Ok(unmet)
    }

    /// Like [`eligible`](Self::eligible), but an ineligible block is an error.
    pub fn require_eligible(&self, id: &str) -> Result<(), DependencyError> {
        let unmet = self.unmet(id)?;
        if unmet.is_empty() {
            Ok(())
        } else {
            Err(DependencyError::NotSatisfied {
                block: BlockId::new(id),
                unmet,
            })
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Explicit adjacency over block ids.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    /// Document order, used for deterministic traversal.
    order: Vec<BlockId>,
    prerequisites: HashMap<BlockId, Vec<BlockId>>,
    dependents: HashMap<BlockId, Vec<BlockId>>,
}

impl DependencyGraph {
    pub fn from_document(document: &Document) -> Self {
        let mut graph = Self {
            order: document.ids().cloned().collect(),
            ..Default::default()
        };

        let mut previous: Option<&BlockId> = None;
        for block in document.iter() {
            let prereqs: Vec<BlockId> = match &block.dependency_spec {
                DependencySpec::None => Vec::new(),
                DependencySpec::Sequential => previous.cloned().into_iter().collect(),
                DependencySpec::Explicit { ids, .. } => ids.iter().cloned().collect(),
            };
            for prereq in &prereqs {
                graph
                    .dependents
                    .entry(prereq.clone())
                    .or_default()
                    .push(block.id.clone());
            }
            graph.prerequisites.insert(block.id.clone(), prereqs);
            previous = Some(&block.id);
        }

        graph
    }

    /// Blocks `id` waits on.
    pub fn prerequisites(&self, id: &str) -> &[BlockId] {
        self.prerequisites.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Blocks waiting on `id`, in document order.
    pub fn dependents(&self, id: &str) -> &[BlockId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Validate the graph and produce an execution order.
    ///
    /// Every block appears after all of its prerequisites; otherwise document
    /// order is kept. Dangling explicit references and cycles are errors.
    pub fn build_order(&self) -> Result<Vec<BlockId>, DependencyError> {
        for id in &self.order {
            let missing: Vec<BlockId> = self
                .prerequisites(id.as_str())
                .iter()
                .filter(|p| !self.prerequisites.contains_key(p.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(DependencyError::UnknownDependency {
                    block: id.clone(),
                    missing,
                });
            }
        }

        let mut colors: HashMap<&BlockId, Color> =
            self.order.iter().map(|id| (id, Color::White)).collect();
        let mut out = Vec::with_capacity(self.order.len());
        let mut stack: Vec<(&BlockId, usize)> = Vec::new();

        for root in &self.order {
            if colors[root] != Color::White {
                continue;
            }
            colors.insert(root, Color::Gray);
            stack.push((root, 0));

            while let Some(top) = stack.last_mut() {
                let node: &BlockId = top.0;
                let prereqs = self.prerequisites(node.as_str());
                if top.1 < prereqs.len() {
                    let child = &prereqs[top.1];
                    top.1 += 1;
                    match colors[child] {
                        Color::White => {
                            colors.insert(child, Color::Gray);
                            stack.push((child, 0));
                        }
                        Color::Gray => {
                            let start = stack
                                .iter()
                                .position(|(id, _)| *id == child)
                                .unwrap_or(0);
                            let involved = self.in_document_order(
                                stack[start..].iter().map(|(id, _)| (*id).clone()),
                            );
                            tracing::warn!(involved = %join_ids(&involved), "dependency cycle detected");
                            return Err(DependencyError::Cycle { involved });
                        }
                        Color::Black => {}
                    }
                } else {
                    colors.insert(node, Color::Black);
                    out.push(node.clone());
                    stack.pop();
                }
            }
        }

        Ok(out)
    }

    fn in_document_order(&self, ids: impl Iterator<Item = BlockId>) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = ids.collect();
        ids.sort_by_key(|id| self.order.iter().position(|o| o == id).unwrap_or(usize::MAX));
        ids
    }
}

/// Validate `document` and produce an execution order.
pub fn build_order(document: &Document) -> Result<Vec<BlockId>, DependencyError> {
    DependencyGraph::from_document(document).build_order()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use runbook_types::{Block, RequiredOutcome, ScriptBlock};

    fn block(id: &str, spec: DependencySpec) -> Block {
        Block::new(id, id, ScriptBlock::new("true")).with_dependency(spec)
    }

    fn chain() -> Document {
        Document::from_blocks([
            block("A", DependencySpec::None),
            block("B", DependencySpec::Sequential),
            block("C", DependencySpec::Sequential),
        ])
        .unwrap()
    }

    fn ids(v: &[BlockId]) -> Vec<&str> {
        v.iter().map(BlockId::as_str).collect()
    }

    #[test]
    fn test_none_always_eligible() {
        let doc = Document::from_blocks([block("A", DependencySpec::None)]).unwrap();
        let states = RunStates::new();
        assert!(Resolver::new(&doc, &states).eligible("A").unwrap());
    }

    #[test]
    fn test_sequential_first_block_eligible() {
        let doc = Document::from_blocks([block("A", DependencySpec::Sequential)]).unwrap();
        let states = RunStates::new();
        assert!(Resolver::new(&doc, &states).eligible("A").unwrap());
    }

    #[test]
    fn test_sequential_waits_for_success() {
        let doc = chain();
        for (state, expected) in [
            (RunState::Idle, false),
            (RunState::Queued, false),
            (RunState::Running, false),
            (RunState::Failed, false),
            (RunState::Stopped, false),
            (RunState::Succeeded, true),
        ] {
            let states: RunStates = [("B", state)].into_iter().collect();
            let resolver = Resolver::new(&doc, &states);
            assert_eq!(resolver.eligible("C").unwrap(), expected, "B = {state}");
        }
    }

    #[test]
    fn test_explicit_outcomes() {
        let doc = Document::from_blocks([
            block("A", DependencySpec::None),
            block("B", DependencySpec::None),
            block("cleanup", DependencySpec::Explicit {
                ids: BTreeSet::from([BlockId::new("A"), BlockId::new("B")]),
                outcome: RequiredOutcome::Finished,
            }),
            block("alert", DependencySpec::Explicit {
                ids: BTreeSet::from([BlockId::new("A")]),
                outcome: RequiredOutcome::Failure,
            }),
        ])
        .unwrap();

        let states: RunStates = [("A", RunState::Failed), ("B", RunState::Running)]
            .into_iter()
            .collect();
        let resolver = Resolver::new(&doc, &states);
        assert_eq!(ids(&resolver.unmet("cleanup").unwrap()), vec!["B"]);
        assert!(resolver.eligible("alert").unwrap());

        let states: RunStates = [("A", RunState::Failed), ("B", RunState::Stopped)]
            .into_iter()
            .collect();
        assert!(Resolver::new(&doc, &states).eligible("cleanup").unwrap());
    }

    #[test]
    fn test_require_eligible_reports_unmet() {
        let doc = chain();
        let states: RunStates = [("A", RunState::Succeeded), ("B", RunState::Running)]
            .into_iter()
            .collect();
        let err = Resolver::new(&doc, &states).require_eligible("C").unwrap_err();
        assert_eq!(
            err,
            DependencyError::NotSatisfied {
                block: BlockId::new("C"),
                unmet: vec![BlockId::new("B")],
            }
        );
    }

    #[test]
    fn test_unknown_block() {
        let doc = chain();
        let states = RunStates::new();
        assert_eq!(
            Resolver::new(&doc, &states).eligible("Z").unwrap_err(),
            DependencyError::UnknownBlock(BlockId::new("Z"))
        );
    }

    #[test]
    fn test_build_order_keeps_document_order() {
        assert_eq!(ids(&build_order(&chain()).unwrap()), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_build_order_puts_prerequisites_first() {
        let doc = Document::from_blocks([
            block("report", DependencySpec::after(["fetch", "parse"])),
            block("fetch", DependencySpec::None),
            block("parse", DependencySpec::Sequential),
            block("lonely", DependencySpec::None),
        ])
        .unwrap();
        assert_eq!(
            ids(&build_order(&doc).unwrap()),
            vec!["fetch", "parse", "report", "lonely"]
        );
    }

    #[test]
    fn test_cycle_names_every_member() {
        // A → B → C sequentially, plus C → A explicitly.
        let doc = Document::from_blocks([
            block("A", DependencySpec::after(["C"])),
            block("B", DependencySpec::Sequential),
            block("C", DependencySpec::Sequential),
        ])
        .unwrap();
        match build_order(&doc).unwrap_err() {
            DependencyError::Cycle { involved } => assert_eq!(ids(&involved), vec!["A", "B", "C"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_cycle() {
        let doc = Document::from_blocks([block("A", DependencySpec::after(["A"]))]).unwrap();
        assert_eq!(
            build_order(&doc).unwrap_err(),
            DependencyError::Cycle { involved: vec![BlockId::new("A")] }
        );
    }

    #[test]
    fn test_cycle_excludes_bystanders() {
        let doc = Document::from_blocks([
            block("setup", DependencySpec::None),
            block("X", DependencySpec::after(["setup", "Y"])),
            block("Y", DependencySpec::after(["X"])),
        ])
        .unwrap();
        match build_order(&doc).unwrap_err() {
            DependencyError::Cycle { involved } => assert_eq!(ids(&involved), vec!["X", "Y"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_dangling_reference() {
        let doc = Document::from_blocks([block("A", DependencySpec::after(["ghost"]))]).unwrap();
        assert_eq!(
            build_order(&doc).unwrap_err(),
            DependencyError::UnknownDependency {
                block: BlockId::new("A"),
                missing: vec![BlockId::new("ghost")],
            }
        );
    }

    #[test]
    fn test_dependents() {
        let doc = Document::from_blocks([
            block("A", DependencySpec::None),
            block("B", DependencySpec::Sequential),
            block("C", DependencySpec::after(["A"])),
        ])
        .unwrap();
        let graph = DependencyGraph::from_document(&doc);
        assert_eq!(ids(graph.dependents("A")), vec!["B", "C"]);
        assert!(graph.dependents("C").is_empty());
        assert_eq!(ids(graph.prerequisites("B")), vec!["A"]);
    }

    #[test]
    fn test_cycle_error_message() {
        let err = DependencyError::Cycle {
            involved: vec![BlockId::new("A"), BlockId::new("B")],
        };
        assert_eq!(err.to_string(), "dependency cycle between blocks: A, B");
    }
}
