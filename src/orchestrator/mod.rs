//! Workflow orchestrator (§4.6): a fixed node graph driving a single
//! question from ingestion through SQL generation, execution, and
//! synthesis, with bounded retry/clarify loops and checkpointing.

pub mod checkpoint;
pub mod graph;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointer};
pub use graph::{
    merge_state, sanitize_question, AgentGraph, InteractionPersistence, Node, NodeName,
    NullInteractionPersistence, RunOutcome, StateFragment, WorkflowConfig, WorkflowResult,
};
