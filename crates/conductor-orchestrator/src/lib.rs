//! Coordination core for multi-agent workflows.
//!
//! A [`CoordinationManager`] owns one workflow: it admits tasks into a
//! dependency graph, queues the runnable ones by priority, assigns them to
//! capable agents below their load limit, retries failures with a decaying
//! score and takes work back from agents that stop sending heartbeats.
//! Every change is journaled so the workflow can be rebuilt after a crash.
//!
//! # Main types
//!
//! - [`CoordinationManager`] — Single writer of task and agent state for one workflow.
//! - [`WorkflowHost`] — Opens, recovers and runs every workflow in a store.
//! - [`Ticker`] — Background scheduling, liveness and snapshot loops.
//! - [`PriorityQueue`] / [`RetryPolicy`] — Score-ordered dispatch queue and retry arithmetic.
//! - [`TaskStore`] — Task records plus the reverse dependency index.
//! - [`AgentRegistry`] — Agent records, eligibility and liveness rules.
//! - [`ConductorConfig`] — Settings loaded from `conductor.toml`.

/// Configuration sections and validation.
pub mod config;
/// Multi-workflow host.
pub mod host;
/// The per-workflow coordination manager.
pub mod manager;
/// Agent table, eligibility and liveness.
pub mod registry;
/// Log sequence numbers and the snapshot watermark.
pub mod sequence;
/// Priority queue and retry policy.
pub mod task_queue;
/// Task table and dependency graph.
pub mod task_store;
/// Background loops.
pub mod ticker;

pub use config::{
    ConductorConfig, CoordinationConfig, LivenessConfig, PersistenceConfig, RateLimitConfig,
    RateLimitSection,
};
pub use host::{HostRecovery, WorkflowHost};
pub use manager::{CoordinationManager, SweepReport};
pub use registry::{is_eligible, liveness_verdict, AgentHandle, AgentRegistry};
pub use sequence::{Sequencer, Ticket};
pub use task_queue::{retry_score, PriorityQueue, QueueEntry, RetryDecision, RetryPolicy};
pub use task_store::{find_cycle, TaskHandle, TaskStore};
pub use ticker::Ticker;
