use crate::types::{AgentId, AgentStatus, Priority, TaskId, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Well-known bus channel names.
pub mod channels {
    use crate::types::AgentId;

    /// Task lifecycle notifications for outside observers.
    pub const TASK_UPDATES: &str = "tasks.updates";
    /// Agent liveness/load notifications.
    pub const AGENT_HEARTBEAT: &str = "agents.heartbeat";
    /// Inbound events reported by agents (heartbeat, completion, failure, cancel ack).
    pub const AGENT_EVENTS: &str = "agents.events";
    /// Alerts that need an operator.
    pub const OPERATOR_ALERTS: &str = "operator.alerts";

    /// Per-agent inbox carrying assignments and cancellation requests.
    pub fn agent_inbox(agent_id: &AgentId) -> String {
        format!("agents.{agent_id}.inbox")
    }
}

/// Every kind of message that travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Coordinator -> agent: run this task.
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        priority: Priority,
        #[serde(default)]
        metadata: HashMap<String, serde_json::Value>,
    },
    /// Coordinator -> observers: a task changed state.
    TaskUpdate {
        task_id: TaskId,
        from_state: TaskState,
        to_state: TaskState,
        timestamp: DateTime<Utc>,
    },
    /// Coordinator -> observers: agent liveness and load.
    AgentHeartbeat {
        agent_id: AgentId,
        status: AgentStatus,
        load_factor: f64,
    },
    /// Coordinator -> agent: stop working on this task and acknowledge.
    CancelRequested { task_id: TaskId, agent_id: AgentId },
    /// Agent -> coordinator: liveness signal.
    Heartbeat { agent_id: AgentId },
    /// Agent -> coordinator: task finished successfully.
    TaskCompleted { task_id: TaskId, agent_id: AgentId },
    /// Agent -> coordinator: task failed.
    TaskFailed {
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
    },
    /// Agent -> coordinator: cancellation honoured.
    CancelAcknowledged { task_id: TaskId, agent_id: AgentId },
    /// Coordinator -> operators: automatic recovery was exhausted.
    OperatorAlert { workflow_id: String, message: String },
}

impl Message {
    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TaskAssigned { .. } => "task_assigned",
            Message::TaskUpdate { .. } => "task_update",
            Message::AgentHeartbeat { .. } => "agent_heartbeat",
            Message::CancelRequested { .. } => "cancel_requested",
            Message::Heartbeat { .. } => "heartbeat",
            Message::TaskCompleted { .. } => "task_completed",
            Message::TaskFailed { .. } => "task_failed",
            Message::CancelAcknowledged { .. } => "cancel_acknowledged",
            Message::OperatorAlert { .. } => "operator_alert",
        }
    }
}

/// Bus envelope: `{ type, payload, timestamp, correlation_id }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    pub timestamp: DateTime<Utc>,
    /// Stitches together every message about one task's lifecycle.
    pub correlation_id: Uuid,
}

impl Envelope {
    /// Wraps a message with an existing correlation id.
    pub fn new(message: Message, correlation_id: Uuid) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    /// Wraps a message that starts a new correlation chain.
    pub fn uncorrelated(message: Message) -> Self {
        Self::new(message, Uuid::new_v4())
    }
}
