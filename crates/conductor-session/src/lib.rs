//! Durable workflow state: snapshots, the per-workflow event journal, and
//! crash recovery by snapshot plus log replay.

pub mod journal;
pub mod recovery;
pub mod store;

pub use journal::{retry_with_backoff, AlertHook, Journal, JournalConfig, JournalStatus};
pub use recovery::{recover, RecoveredWorkflow, RecoveryReport, ReplayGap};
pub use store::{
    validate_workflow_id, DamagedRecord, EventLog, FileWorkflowStore, MemoryWorkflowStore,
    WorkflowStore,
};
