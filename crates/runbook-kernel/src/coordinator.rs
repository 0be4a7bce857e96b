//! Run coordinator: owns run states and turns requests into bus signals.
//!
//! Requesters ask the coordinator to run or stop blocks; the coordinator
//! checks eligibility, records `Queued`, and publishes on the [`ControlBus`].
//! Executors report progress back through [`RunCoordinator::report`].
//!
//! ```text
//!  UI ──request_run──► RunCoordinator ──publish_run──► ControlBus ──► executor
//!                           ▲                                            │
//!                           └───────────────── report(state) ────────────┘
//! ```
//!
//! A whole-document run validates the dependency graph up front, then
//! dispatches blocks as their prerequisites are satisfied. A failed block
//! leaves its dependents idle; unrelated branches carry on.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use runbook_types::{BlockId, Document, RunState};

use crate::control::{ControlBus, SignalKind};
use crate::resolver::{DependencyError, DependencyGraph, Resolver, RunStates};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("block {block} is already {state}")]
    AlreadyActive { block: BlockId, state: RunState },

    #[error("block {block} cannot go from {from} to {to}")]
    InvalidReport {
        block: BlockId,
        from: RunState,
        to: RunState,
    },
}

/// Executors may move a block `Queued → Running`, and into a terminal state
/// from `Queued` or `Running`. Repeating `Running` is accepted.
fn can_report(from: RunState, to: RunState) -> bool {
    match to {
        RunState::Running => matches!(from, RunState::Queued | RunState::Running),
        to if to.is_terminal() => from.is_active(),
        _ => false,
    }
}

/// Emitted on every recorded state change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub block: BlockId,
    pub state: RunState,
}

struct State {
    document: Document,
    graph: DependencyGraph,
    states: RunStates,
    /// Planned blocks not yet dispatched, in build order. `None` when no
    /// whole-document run is in progress.
    plan: Option<Vec<BlockId>>,
}

impl State {
    fn record(&mut self, block: &BlockId, state: RunState, events: &mut Vec<RunEvent>) {
        if self.states.set(block.clone(), state) != state {
            events.push(RunEvent {
                block: block.clone(),
                state,
            });
        }
    }

    /// Queue every planned block that has become eligible.
    fn advance_plan(&mut self, events: &mut Vec<RunEvent>) -> Vec<BlockId> {
        let Some(pending) = self.plan.take() else {
            return Vec::new();
        };

        let (ready, waiting): (Vec<BlockId>, Vec<BlockId>) = {
            let resolver = Resolver::new(&self.document, &self.states);
            pending
                .into_iter()
                .partition(|id| resolver.eligible(id.as_str()).unwrap_or(false))
        };
        for id in &ready {
            self.record(id, RunState::Queued, events);
        }

        let any_active = self.states.iter().any(|(_, s)| s.is_active());
        if waiting.is_empty() {
            debug!("document run fully dispatched");
        } else if !any_active {
            info!(
                not_run = waiting.len(),
                "document run halted; remaining blocks have unmet prerequisites"
            );
        } else {
            self.plan = Some(waiting);
        }
        ready
    }
}

/// Coordinates runs for one document.
pub struct RunCoordinator {
    state: Mutex<State>,
    bus: ControlBus,
    events: broadcast::Sender<RunEvent>,
}

impl RunCoordinator {
    pub fn new(document: Document, bus: ControlBus, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: Mutex::new(State {
                graph: DependencyGraph::from_document(&document),
                document,
                states: RunStates::new(),
                plan: None,
            }),
            bus,
            events,
        }
    }

    pub fn bus(&self) -> &ControlBus {
        &self.bus
    }

    /// Receive every state change from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn document(&self) -> Document {
        self.state.lock().document.clone()
    }

    pub fn state(&self, block: &str) -> RunState {
        self.state.lock().states.get(block)
    }

    /// Snapshot of all recorded states.
    pub fn states(&self) -> RunStates {
        self.state.lock().states.clone()
    }

    /// Planned blocks still waiting to be dispatched.
    pub fn active_plan(&self) -> Option<Vec<BlockId>> {
        self.state.lock().plan.clone()
    }

    pub fn eligible(&self, block: &str) -> Result<bool, DependencyError> {
        let state = self.state.lock();
        Resolver::new(&state.document, &state.states).eligible(block)
    }

    /// Ask executors to run one block.
    ///
    /// Rejected when the block is unknown, already queued or running, or its
    /// prerequisites are unmet. Prerequisites are never run implicitly.
    /// Returns the number of handlers signalled. With no executor subscribed
    /// the block stays `Queued`; if the signal cannot be delivered at all (no
    /// tokio runtime) the block goes back to `Idle`.
    pub fn request_run(&self, block: &str) -> Result<usize, RunError> {
        let mut events = Vec::new();
        let id = {
            let mut state = self.state.lock();
            let Some(found) = state.document.get(block) else {
                return Err(DependencyError::UnknownBlock(BlockId::new(block)).into());
            };
            let id = found.id.clone();

            let current = state.states.get(block);
            if current.is_active() {
                return Err(RunError::AlreadyActive {
                    block: id,
                    state: current,
                });
            }
            Resolver::new(&state.document, &state.states).require_eligible(block)?;
            state.record(&id, RunState::Queued, &mut events);
            id
        };

        self.emit(events);
        Ok(self.dispatch(&id))
    }

    /// Ask executors to stop a block. Advisory: the state changes only when
    /// an executor reports `Stopped`.
    pub fn request_stop(&self, block: &str) -> Result<usize, RunError> {
        let id = match self.state.lock().document.get(block) {
            Some(found) => found.id.clone(),
            None => return Err(DependencyError::UnknownBlock(BlockId::new(block)).into()),
        };
        Ok(self.bus.publish_stop(id))
    }

    /// Record progress reported by an executor.
    ///
    /// Only progress from a dispatched block is accepted: `Running` needs the
    /// block to be `Queued`, a terminal state needs it `Queued` or `Running`.
    /// Terminal states may unblock planned dependents, which are dispatched
    /// before this returns.
    pub fn report(&self, block: &str, run_state: RunState) -> Result<(), RunError> {
        let mut events = Vec::new();
        let ready = {
            let mut state = self.state.lock();
            let Some(found) = state.document.get(block) else {
                return Err(DependencyError::UnknownBlock(BlockId::new(block)).into());
            };
            let id = found.id.clone();
            let current = state.states.get(block);
            if !can_report(current, run_state) {
                warn!(block = %id, from = %current, to = %run_state, "rejected run report");
                return Err(RunError::InvalidReport {
                    block: id,
                    from: current,
                    to: run_state,
                });
            }
            state.record(&id, run_state, &mut events);
            if run_state == RunState::Failed {
                warn!(block = %id, "block failed; dependents will not run");
            }
            if run_state.is_terminal() {
                state.advance_plan(&mut events)
            } else {
                Vec::new()
            }
        };

        self.emit(events);
        for id in &ready {
            self.dispatch(id);
        }
        Ok(())
    }

    /// Run the whole document.
    ///
    /// The dependency graph is validated first; a cycle or dangling reference
    /// fails the request before any state changes or signal is sent. Returns
    /// the blocks dispatched in the first wave.
    pub fn run_all(&self) -> Result<Vec<BlockId>, RunError> {
        let mut events = Vec::new();
        let ready = {
            let mut state = self.state.lock();
            let order = state.graph.build_order()?;

            if let Some((id, current)) = order
                .iter()
                .map(|id| (id, state.states.get(id.as_str())))
                .find(|(_, s)| s.is_active())
            {
                return Err(RunError::AlreadyActive {
                    block: id.clone(),
                    state: current,
                });
            }

            for id in &order {
                state.record(id, RunState::Idle, &mut events);
            }
            info!(blocks = order.len(), "document run started");
            state.plan = Some(order);
            state.advance_plan(&mut events)
        };

        self.emit(events);
        for id in &ready {
            self.dispatch(id);
        }
        Ok(ready)
    }

    fn dispatch(&self, id: &BlockId) -> usize {
        match self.bus.try_publish(id.clone(), SignalKind::Run) {
            Ok(0) => {
                warn!(block = %id, "no executor subscribed; block stays queued");
                0
            }
            Ok(handlers) => handlers,
            Err(e) => {
                warn!(block = %id, error = %e, "run signal dropped; block back to idle");
                let mut events = Vec::new();
                {
                    let mut state = self.state.lock();
                    if state.states.get(id.as_str()) == RunState::Queued {
                        state.record(id, RunState::Idle, &mut events);
                    }
                    if !state.states.iter().any(|(_, s)| s.is_active()) {
                        state.plan = None;
                    }
                }
                self.emit(events);
                0
            }
        }
    }

    fn emit(&self, events: Vec<RunEvent>) {
        for event in events {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RunCoordinator")
            .field("blocks", &state.document.len())
            .field("plan", &state.plan.as_ref().map(Vec::len))
            .finish()
    }
}
