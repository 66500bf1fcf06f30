//! Agent core: the per-agent decision loop and everything it owns.
//!
//! `coordinator` drives iterations; `decision` talks to the model;
//! `heuristics` and `stats` shape prompts from observed outcomes;
//! `memory` holds the durable notes and decision log.

pub mod coordinator;
pub mod decision;
pub mod heuristics;
pub mod memory;
pub mod prompt;
pub mod schema;
pub mod state;
pub mod stats;

pub use coordinator::{
    AgentClient, AgentRequest, CheckpointReceipt, CoordinatorConfig, ExternalTurn,
    IterationOutcome, LoopCoordinator, TurnResult,
};
pub use decision::{Decision, DecisionInputs, DecisionOutcome, DecisionStep};
pub use state::{AgentRecord, AgentStatus, GameState, ScreenKind, VisualChange};
