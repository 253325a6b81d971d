use crate::error::{ConductorError, ConductorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a [`Task`].
    TaskId
);
string_id!(
    /// Identifier of an [`Agent`].
    AgentId
);

/// Scheduling priority of a task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Base queue score for this priority.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Low => 1.0,
            Priority::Normal => 2.0,
            Priority::High => 3.0,
            Priority::Urgent => 4.0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::InProgress => write!(f, "in_progress"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Blocked => write!(f, "blocked"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Stale,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Stale => write!(f, "stale"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Submission request for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<TaskId>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Capabilities an agent must have to run this task.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Overrides the configured retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Propagated on every bus message about this task.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Caller key used for submission rate limiting.
    #[serde(default)]
    pub submitter: Option<String>,
    /// Longest a single run may take, in seconds, before it counts as a failure.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Cancel the task if it has not started by then.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn submitted_by(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }

    /// Run timeout, rounded down to whole seconds.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Rejects specs with blank identifiers or capability names, or a zero timeout.
    pub fn validate(&self) -> ConductorResult<()> {
        if let Some(id) = &self.id {
            if id.as_str().trim().is_empty() {
                return Err(ConductorError::TaskValidation(
                    "task id must not be empty".into(),
                ));
            }
        }
        if self.dependencies.iter().any(|d| d.as_str().trim().is_empty()) {
            return Err(ConductorError::TaskValidation(
                "dependency ids must not be empty".into(),
            ));
        }
        if self
            .required_capabilities
            .iter()
            .any(|c| c.trim().is_empty())
        {
            return Err(ConductorError::TaskValidation(
                "capability names must not be empty".into(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConductorError::TaskValidation(
                "timeout must be at least one second".into(),
            ));
        }
        Ok(())
    }
}

/// Authoritative record of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub priority: Priority,
    pub state: TaskState,
    /// Set iff `state == InProgress`.
    pub assigned_agent: Option<AgentId>,
    pub dependencies: BTreeSet<TaskId>,
    pub required_capabilities: BTreeSet<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Order of admission, used as the FIFO key when the queue is rebuilt.
    pub submission_seq: u64,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Bumped on every applied transition; guards replay.
    pub version: u64,
}

impl Task {
    /// Builds the initial record for an admitted spec.
    pub fn from_spec(
        id: TaskId,
        spec: TaskSpec,
        state: TaskState,
        default_max_retries: u32,
        submission_seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            priority: spec.priority,
            state,
            assigned_agent: None,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            metadata: spec.metadata,
            correlation_id: spec.correlation_id.unwrap_or_else(Uuid::new_v4),
            created_at: now,
            submission_seq,
            cancel_requested: false,
            last_error: None,
            timeout_secs: spec.timeout_secs,
            deadline: spec.deadline,
            version: 0,
        }
    }

    /// Whether a running task has used up its run timeout at `now`.
    pub fn run_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.state, self.timeout_secs, self.started_at) {
            (TaskState::InProgress, Some(secs), Some(started)) => {
                i64::try_from(secs).is_ok_and(|secs| (now - started).num_seconds() >= secs)
            }
            _ => false,
        }
    }

    /// Whether a task that never started is past its deadline at `now`.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, TaskState::Pending | TaskState::Blocked)
            && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// True when every dependency id is in `completed`.
    pub fn dependencies_met<F>(&self, mut is_completed: F) -> bool
    where
        F: FnMut(&TaskId) -> bool,
    {
        self.dependencies.iter().all(|dep| is_completed(dep))
    }
}

/// Registration request for an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(default)]
    pub id: Option<AgentId>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl AgentSpec {
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: Some(id.into()),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

/// Liveness, capability and load record for a worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub current_tasks: BTreeSet<TaskId>,
    pub completed_tasks: BTreeSet<TaskId>,
    pub last_heartbeat: DateTime<Utc>,
    /// `current_tasks.len() / max_agent_load`.
    pub load_factor: f64,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub version: u64,
}

impl Agent {
    pub fn new(id: AgentId, capabilities: BTreeSet<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            current_tasks: BTreeSet::new(),
            completed_tasks: BTreeSet::new(),
            last_heartbeat: now,
            load_factor: 0.0,
            capabilities,
            status: AgentStatus::Active,
            registered_at: now,
            version: 1,
        }
    }

    /// Whether this agent has every capability in `required`.
    pub fn can_run(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Why a task changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// All dependencies completed.
    Unblocked,
    /// Handed to an agent by a scheduling tick.
    Assigned,
    /// The agent reported success.
    Completed,
    /// The agent reported failure and the retry budget allows another run.
    Retried,
    /// The agent reported failure and the retry budget is spent.
    RetriesExhausted,
    /// The agent went stale or was deregistered; not counted as a failure.
    Reassigned,
    /// Cancellation was requested for a running task.
    CancelRequested,
    /// The task was cancelled.
    Cancelled,
    /// A dependency ended failed or cancelled.
    DependencyFailed,
    /// A run outlasted the task's timeout; counted as a failure.
    TimedOut,
    /// The deadline passed before the task started.
    DeadlineExpired,
}

/// Immutable audit record of a single task transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: TaskId,
    pub from_state: TaskState,
    pub to_state: TaskState,
    /// The agent involved: the assignee for `Assigned`, the previous
    /// assignee when leaving `InProgress`.
    pub agent: Option<AgentId>,
    pub cause: TransitionCause,
    /// Task version after this transition.
    pub task_version: u64,
    /// Agent version after this transition, when an agent was touched.
    #[serde(default)]
    pub agent_version: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
}
