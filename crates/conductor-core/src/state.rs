use crate::transition::{apply_heartbeat, apply_status, apply_to_agent, apply_to_task};
use crate::types::{Agent, AgentId, AgentStatus, Task, TaskHistoryEntry, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry of a workflow's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEvent {
    TaskSubmitted {
        task: Task,
    },
    Transition(TaskHistoryEntry),
    AgentRegistered {
        agent: Agent,
    },
    AgentHeartbeat {
        agent_id: AgentId,
        at: DateTime<Utc>,
        agent_version: u64,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
        at: DateTime<Utc>,
        agent_version: u64,
    },
    AgentDeregistered {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    TaskArchived {
        task_id: TaskId,
        at: DateTime<Utc>,
    },
}

/// A sequenced [`WorkflowEvent`] as written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub workflow_id: String,
    /// Strictly increasing per workflow.
    pub seq: u64,
    pub event: WorkflowEvent,
}

/// Point-in-time capture of a workflow's tasks and agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    /// Highest log `seq` whose effects are contained in this snapshot.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
}

/// Result of applying one event to a [`WorkflowState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The entity already reflects this event.
    AlreadyApplied,
    UnknownTask(TaskId),
    UnknownAgent(AgentId),
}

/// Plain, lock-free view of a workflow: the task graph and the agent table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub tasks: BTreeMap<TaskId, Task>,
    pub agents: BTreeMap<AgentId, Agent>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freezes this state into a snapshot record.
    pub fn to_snapshot(&self, workflow_id: &str, version: u64, at: DateTime<Utc>) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: workflow_id.to_string(),
            version,
            timestamp: at,
            tasks: self.tasks.values().cloned().collect(),
            agents: self.agents.values().cloned().collect(),
        }
    }

    /// Applies one logged event using the shared transition functions.
    pub fn apply(&mut self, event: &WorkflowEvent, max_agent_load: usize) -> ApplyOutcome {
        match event {
            WorkflowEvent::TaskSubmitted { task } => {
                if self.tasks.contains_key(&task.id) {
                    return ApplyOutcome::AlreadyApplied;
                }
                self.tasks.insert(task.id.clone(), task.clone());
                ApplyOutcome::Applied
            }
            WorkflowEvent::Transition(entry) => {
                let Some(task) = self.tasks.get_mut(&entry.task_id) else {
                    return ApplyOutcome::UnknownTask(entry.task_id.clone());
                };
                let mut applied = apply_to_task(task, entry);
                if entry.agent_version.is_some() {
                    if let Some(agent_id) = &entry.agent {
                        match self.agents.get_mut(agent_id) {
                            Some(agent) => applied |= apply_to_agent(agent, entry, max_agent_load),
                            None if applied => {
                                return ApplyOutcome::UnknownAgent(agent_id.clone())
                            }
                            None => {}
                        }
                    }
                }
                if applied {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::AlreadyApplied
                }
            }
            WorkflowEvent::AgentRegistered { agent } => {
                if self.agents.contains_key(&agent.id) {
                    return ApplyOutcome::AlreadyApplied;
                }
                self.agents.insert(agent.id.clone(), agent.clone());
                ApplyOutcome::Applied
            }
            WorkflowEvent::AgentHeartbeat {
                agent_id,
                at,
                agent_version,
            } => match self.agents.get_mut(agent_id) {
                Some(agent) => {
                    if apply_heartbeat(agent, *at, *agent_version) {
                        ApplyOutcome::Applied
                    } else {
                        ApplyOutcome::AlreadyApplied
                    }
                }
                None => ApplyOutcome::UnknownAgent(agent_id.clone()),
            },
            WorkflowEvent::AgentStatusChanged {
                agent_id,
                status,
                agent_version,
                ..
            } => match self.agents.get_mut(agent_id) {
                Some(agent) => {
                    if apply_status(agent, *status, *agent_version) {
                        ApplyOutcome::Applied
                    } else {
                        ApplyOutcome::AlreadyApplied
                    }
                }
                None => ApplyOutcome::UnknownAgent(agent_id.clone()),
            },
            WorkflowEvent::AgentDeregistered { agent_id, .. } => {
                if self.agents.remove(agent_id).is_some() {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::AlreadyApplied
                }
            }
            WorkflowEvent::TaskArchived { task_id, .. } => {
                if self.tasks.remove(task_id).is_some() {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::AlreadyApplied
                }
            }
        }
    }
}

impl From<WorkflowSnapshot> for WorkflowState {
    fn from(snapshot: WorkflowSnapshot) -> Self {
        Self {
            tasks: snapshot
                .tasks
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
            agents: snapshot
                .agents
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
        }
    }
}
