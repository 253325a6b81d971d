//! Core types and error definitions for the Conductor coordination core.
//!
//! This crate provides the data model shared across all Conductor crates:
//! tasks, agents, the append-only history, workflow snapshots, the bus
//! envelope, and the pure transition functions used both by live
//! coordination and by snapshot replay.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`Task`] / [`Agent`] — Authoritative task and agent records.
//! - [`TaskHistoryEntry`] — Immutable record of one task transition.
//! - [`WorkflowState`] / [`WorkflowSnapshot`] / [`LogRecord`] — Persistence model.
//! - [`Envelope`] / [`Message`] — Bus message envelope and its tagged payloads.
//! - [`Clock`] — Injectable time source.

/// Injectable wall-clock.
pub mod clock;
/// Error types.
pub mod error;
/// Bus envelope, message kinds and well-known channel names.
pub mod message;
/// Workflow snapshot, log records and replayable state.
pub mod state;
/// Pure transition functions shared by live operation and replay.
pub mod transition;
/// Task, agent and history types.
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConductorError, ConductorResult};
pub use message::{channels, Envelope, Message};
pub use state::{ApplyOutcome, LogRecord, WorkflowEvent, WorkflowSnapshot, WorkflowState};
pub use types::{
    Agent, AgentId, AgentSpec, AgentStatus, Priority, Task, TaskHistoryEntry, TaskId, TaskSpec,
    TaskState, TransitionCause,
};
