//! Pure state-transition functions.
//!
//! Live coordination and snapshot replay both mutate tasks and agents only
//! through these functions, so a replayed log produces exactly the state that
//! live processing produced. Every function is idempotent: an entry whose
//! version is not newer than the entity's version is ignored.

use crate::types::{Agent, AgentStatus, Task, TaskHistoryEntry, TaskState, TransitionCause};
use chrono::{DateTime, Utc};

/// Load factor for an agent running `current` tasks out of `max_load`.
pub fn load_factor(current: usize, max_load: usize) -> f64 {
    if max_load == 0 {
        return 1.0;
    }
    current as f64 / max_load as f64
}

/// Whether `from -> to` is a legal edge of the task state machine for `cause`.
pub fn is_valid_transition(from: TaskState, to: TaskState, cause: TransitionCause) -> bool {
    use TaskState::*;
    use TransitionCause as C;
    matches!(
        (from, to, cause),
        (Blocked, Pending, C::Unblocked)
            | (Pending, InProgress, C::Assigned)
            | (InProgress, Completed, C::Completed)
            | (InProgress, Pending, C::Retried)
            | (InProgress, Failed, C::RetriesExhausted)
            | (InProgress, Pending, C::Reassigned)
            | (InProgress, InProgress, C::CancelRequested)
            | (Pending | Blocked | InProgress, Cancelled, C::Cancelled)
            | (Blocked | Pending, Failed, C::DependencyFailed)
            | (InProgress, Pending | Failed, C::TimedOut)
            | (Pending | Blocked, Cancelled, C::DeadlineExpired)
    )
}

/// Applies `entry` to `task`. Returns `false` when the entry was already applied.
pub fn apply_to_task(task: &mut Task, entry: &TaskHistoryEntry) -> bool {
    if entry.task_version <= task.version {
        return false;
    }
    match entry.cause {
        TransitionCause::Unblocked => {}
        TransitionCause::Assigned => {
            task.assigned_agent = entry.agent.clone();
            task.started_at = Some(entry.timestamp);
        }
        TransitionCause::Completed => {
            task.assigned_agent = None;
            task.completed_at = Some(entry.timestamp);
        }
        TransitionCause::Retried => {
            task.assigned_agent = None;
            task.started_at = None;
            task.retry_count += 1;
            task.last_error = entry.reason.clone();
        }
        TransitionCause::RetriesExhausted | TransitionCause::DependencyFailed => {
            task.assigned_agent = None;
            task.completed_at = Some(entry.timestamp);
            task.last_error = entry.reason.clone();
        }
        TransitionCause::Reassigned => {
            task.assigned_agent = None;
            task.started_at = None;
        }
        TransitionCause::CancelRequested => {
            task.cancel_requested = true;
        }
        TransitionCause::Cancelled => {
            task.assigned_agent = None;
            task.completed_at = Some(entry.timestamp);
        }
        TransitionCause::TimedOut => {
            task.assigned_agent = None;
            task.last_error = entry.reason.clone();
            if entry.to_state == TaskState::Pending {
                task.started_at = None;
                task.retry_count += 1;
            } else {
                task.completed_at = Some(entry.timestamp);
            }
        }
        TransitionCause::DeadlineExpired => {
            task.completed_at = Some(entry.timestamp);
            task.last_error = entry.reason.clone();
        }
    }
    task.state = entry.to_state;
    task.version = entry.task_version;
    true
}

/// Applies the agent side of `entry`. Returns `false` when there is nothing
/// to apply or it was already applied.
pub fn apply_to_agent(agent: &mut Agent, entry: &TaskHistoryEntry, max_load: usize) -> bool {
    let Some(version) = entry.agent_version else {
        return false;
    };
    if version <= agent.version {
        return false;
    }
    match entry.cause {
        TransitionCause::Assigned => {
            agent.current_tasks.insert(entry.task_id.clone());
        }
        TransitionCause::Completed => {
            agent.current_tasks.remove(&entry.task_id);
            agent.completed_tasks.insert(entry.task_id.clone());
        }
        TransitionCause::Retried
        | TransitionCause::RetriesExhausted
        | TransitionCause::Reassigned
        | TransitionCause::TimedOut
        | TransitionCause::Cancelled => {
            agent.current_tasks.remove(&entry.task_id);
        }
        TransitionCause::Unblocked
        | TransitionCause::CancelRequested
        | TransitionCause::DependencyFailed
        | TransitionCause::DeadlineExpired => {}
    }
    agent.load_factor = load_factor(agent.current_tasks.len(), max_load);
    agent.version = version;
    true
}

/// Records a heartbeat; a stale or offline agent becomes active again.
pub fn apply_heartbeat(agent: &mut Agent, at: DateTime<Utc>, version: u64) -> bool {
    if version <= agent.version {
        return false;
    }
    agent.last_heartbeat = at;
    agent.status = AgentStatus::Active;
    agent.version = version;
    true
}

/// Sets the liveness status of an agent.
pub fn apply_status(agent: &mut Agent, status: AgentStatus, version: u64) -> bool {
    if version <= agent.version {
        return false;
    }
    agent.status = status;
    agent.version = version;
    true
}
