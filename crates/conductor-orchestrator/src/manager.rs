use crate::config::ConductorConfig;
use crate::registry::{is_eligible, liveness_verdict, AgentHandle, AgentRegistry};
use crate::sequence::Sequencer;
use crate::task_queue::{retry_score, PriorityQueue, QueueEntry, RetryDecision, RetryPolicy};
use crate::task_store::{TaskHandle, TaskStore};
use chrono::{DateTime, Utc};
use conductor_channels::{FnSubscriber, MessageBus};
use conductor_core::transition::{
    apply_heartbeat, apply_status, apply_to_agent, apply_to_task, is_valid_transition,
};
use conductor_core::{
    channels, Agent, AgentId, AgentSpec, AgentStatus, Clock, ConductorError, ConductorResult,
    Envelope, LogRecord, Message, Task, TaskHistoryEntry, TaskId, TaskSpec, TaskState,
    TransitionCause, WorkflowEvent, WorkflowSnapshot, WorkflowState,
};
use conductor_security::RateLimiter;
use conductor_session::{
    recover, retry_with_backoff, validate_workflow_id, AlertHook, Journal, JournalStatus,
    RecoveredWorkflow, RecoveryReport, WorkflowStore,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ANONYMOUS_SUBMITTER: &str = "anonymous";

/// Result of one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: Vec<AgentId>,
    pub offline: Vec<AgentId>,
    /// Tasks taken back from agents that went stale.
    pub reassigned: Vec<TaskId>,
    /// Running tasks that outlasted their timeout.
    pub timed_out: Vec<TaskId>,
    /// Waiting tasks cancelled because their deadline passed.
    pub expired: Vec<TaskId>,
}

/// What the sweep did to a task that hit its timeout or deadline.
enum Limit {
    TimedOut(TaskState),
    Expired,
}

enum Dispatch {
    Assigned,
    /// The entry no longer refers to a pending task.
    Skipped,
    NoAgent,
}

/// Coordinates one workflow: the only writer of task and agent state.
///
/// Every change to a task happens under that task's lock, every change to an
/// agent under that agent's lock, always taken task first. Each change is
/// applied through the shared transition functions, given a log sequence
/// number and handed to the journal before the locks are released, so replay
/// reproduces live state exactly.
pub struct CoordinationManager {
    workflow_id: String,
    config: ConductorConfig,
    clock: Arc<dyn Clock>,
    tasks: TaskStore,
    agents: AgentRegistry,
    queue: PriorityQueue,
    retry: RetryPolicy,
    assignment_limiter: RateLimiter,
    submission_limiter: RateLimiter,
    bus: Arc<MessageBus>,
    store: Arc<dyn WorkflowStore>,
    journal: Journal,
    sequencer: Sequencer,
    submissions: AtomicU64,
    last_snapshot: AtomicU64,
    snapshot_failed: AtomicBool,
    snapshot_lock: tokio::sync::Mutex<()>,
    tick_lock: parking_lot::Mutex<()>,
}

impl CoordinationManager {
    /// Start a workflow with no persisted history.
    pub fn new(
        workflow_id: impl Into<String>,
        config: ConductorConfig,
        store: Arc<dyn WorkflowStore>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> ConductorResult<Self> {
        Self::build(workflow_id.into(), config, store, bus, clock, 0, 0)
    }

    /// Recover a workflow from its store and resume it.
    pub async fn open(
        workflow_id: &str,
        config: ConductorConfig,
        store: Arc<dyn WorkflowStore>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> ConductorResult<(Self, RecoveryReport)> {
        validate_workflow_id(workflow_id)?;
        let recovered = recover(
            store.as_ref(),
            workflow_id,
            config.coordination.max_agent_load,
        )
        .await?;
        let report = recovered.report.clone();
        // Damaged snapshots still occupy their version; never write below them.
        let newest = store
            .snapshot_versions(workflow_id)
            .await?
            .into_iter()
            .max()
            .unwrap_or(0);
        let manager = Self::from_recovered(workflow_id, config, store, bus, clock, recovered)?;
        if newest > report.snapshot_version.unwrap_or(0) {
            warn!(
                workflow_id,
                newest,
                loaded = ?report.snapshot_version,
                "newer snapshots are unreadable, next snapshot waits past them"
            );
            manager.last_snapshot.fetch_max(newest, Ordering::SeqCst);
        }
        if !report.is_clean() {
            manager.alert(format!(
                "recovered with {} gap(s) in the event log, last seq {}",
                report.gaps.len(),
                report.last_seq
            ));
        }
        Ok((manager, report))
    }

    /// Resume from recovered state: rebuild the queue from pending tasks in
    /// submission order and settle anything a crash left half-done.
    pub fn from_recovered(
        workflow_id: impl Into<String>,
        config: ConductorConfig,
        store: Arc<dyn WorkflowStore>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
        recovered: RecoveredWorkflow,
    ) -> ConductorResult<Self> {
        let report = recovered.report;
        let manager = Self::build(
            workflow_id.into(),
            config,
            store,
            bus,
            clock,
            report.last_seq,
            report.snapshot_version.unwrap_or(0),
        )?;

        let WorkflowState { tasks, agents } = recovered.state;
        for agent in agents.into_values() {
            manager.agents.insert_with(agent, |_| ())?;
        }

        let mut pending = Vec::new();
        let mut blocked = Vec::new();
        let mut orphaned = Vec::new();
        let mut next_submission = 0;
        for task in tasks.into_values() {
            next_submission = next_submission.max(task.submission_seq + 1);
            match task.state {
                TaskState::Pending => pending.push((
                    task.submission_seq,
                    task.id.clone(),
                    manager.score(&task),
                )),
                TaskState::Blocked => blocked.push(task.id.clone()),
                TaskState::InProgress => {
                    if let Some(agent_id) = &task.assigned_agent {
                        if !manager.agents.contains(agent_id) {
                            orphaned.push((task.id.clone(), agent_id.clone()));
                        }
                    }
                }
                _ => {}
            }
            manager.tasks.restore(task);
        }
        manager.submissions.store(next_submission, Ordering::SeqCst);

        pending.sort_by_key(|(seq, _, _)| *seq);
        for (_, id, score) in pending {
            manager.queue.enqueue(id, score);
        }
        for id in blocked {
            manager.settle_blocked(&id);
        }
        for (task_id, agent_id) in orphaned {
            manager.reassign(&task_id, &agent_id, "assigned agent missing after recovery");
        }

        info!(
            workflow_id = %manager.workflow_id,
            tasks = manager.tasks.len(),
            agents = manager.agents.len(),
            queued = manager.queue.len(),
            "workflow resumed"
        );
        Ok(manager)
    }

    fn build(
        workflow_id: String,
        config: ConductorConfig,
        store: Arc<dyn WorkflowStore>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
        last_seq: u64,
        last_snapshot: u64,
    ) -> ConductorResult<Self> {
        validate_workflow_id(&workflow_id)?;
        config.validate()?;

        let alert: AlertHook = {
            let bus = bus.clone();
            let workflow_id = workflow_id.clone();
            Arc::new(move |message: String| {
                bus.publish(
                    channels::OPERATOR_ALERTS,
                    Envelope::uncorrelated(Message::OperatorAlert {
                        workflow_id: workflow_id.clone(),
                        message,
                    }),
                );
            })
        };
        let journal = Journal::spawn(
            workflow_id.clone(),
            store.clone(),
            config.persistence.journal(),
            Some(alert),
        );

        let limits = &config.rate_limit;
        Ok(Self {
            assignment_limiter: RateLimiter::with_clock(
                limits.assignment.max_requests,
                limits.assignment.window(),
                clock.clone(),
            ),
            submission_limiter: RateLimiter::with_clock(
                limits.submission.max_requests,
                limits.submission.window(),
                clock.clone(),
            ),
            retry: RetryPolicy::new(config.coordination.retry_penalty),
            workflow_id,
            config,
            clock,
            tasks: TaskStore::new(),
            agents: AgentRegistry::new(),
            queue: PriorityQueue::new(),
            bus,
            store,
            journal,
            sequencer: Sequencer::starting_after(last_seq),
            submissions: AtomicU64::new(0),
            last_snapshot: AtomicU64::new(last_snapshot),
            snapshot_failed: AtomicBool::new(false),
            snapshot_lock: tokio::sync::Mutex::new(()),
            tick_lock: parking_lot::Mutex::new(()),
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    // --- submission and task lifecycle -----------------------------------

    /// Admit one task. Returns its id.
    pub fn submit_task(&self, spec: TaskSpec) -> ConductorResult<TaskId> {
        self.submit_batch(vec![spec])?
            .pop()
            .ok_or_else(|| ConductorError::TaskValidation("nothing was admitted".into()))
    }

    /// Admit a batch of tasks that may depend on each other. Either every
    /// task is admitted or none is.
    pub fn submit_batch(&self, specs: Vec<TaskSpec>) -> ConductorResult<Vec<TaskId>> {
        if specs.is_empty() {
            return Err(ConductorError::TaskValidation("empty submission".into()));
        }
        let now = self.clock.now();
        for spec in &specs {
            spec.validate()?;
            if spec.deadline.is_some_and(|deadline| deadline <= now) {
                return Err(ConductorError::TaskValidation(format!(
                    "deadline of task {} has already passed",
                    spec.id.as_ref().map_or("<unnamed>", |id| id.as_str())
                )));
            }
        }
        let submitters: BTreeSet<&str> = specs
            .iter()
            .map(|s| s.submitter.as_deref().unwrap_or(ANONYMOUS_SUBMITTER))
            .collect();
        for key in submitters {
            self.submission_limiter.check(key)?;
        }

        let default_max_retries = self.config.coordination.default_max_retries;
        let batch: Vec<Task> = specs
            .into_iter()
            .map(|spec| {
                let id = spec.id.clone().unwrap_or_else(TaskId::generate);
                let seq = self.submissions.fetch_add(1, Ordering::SeqCst);
                Task::from_spec(id, spec, TaskState::Blocked, default_max_retries, seq, now)
            })
            .collect();

        let admitted = self.tasks.admit_with(batch, |task| {
            let ticket = self.sequencer.begin();
            self.record(
                ticket.seq(),
                WorkflowEvent::TaskSubmitted { task: task.clone() },
            );
            ticket
        })?;

        let mut ids = Vec::with_capacity(admitted.len());
        for task in &admitted {
            info!(
                workflow_id = %self.workflow_id,
                task_id = %task.id,
                priority = %task.priority,
                state = %task.state,
                correlation_id = %task.correlation_id,
                "task admitted"
            );
            if task.state == TaskState::Pending {
                self.queue.enqueue(task.id.clone(), self.score(task));
            }
            ids.push(task.id.clone());
        }
        // A dependency may have finished between admission and indexing.
        for task in &admitted {
            if task.state == TaskState::Blocked {
                self.settle_blocked(&task.id);
            }
        }
        Ok(ids)
    }

    /// Cancel a task. Pending and blocked tasks end immediately; a running
    /// task gets an advisory cancel and ends once its agent acknowledges.
    /// Returns the task's state after the call.
    pub fn cancel_task(&self, id: &TaskId) -> ConductorResult<TaskState> {
        let handle = self.task_handle(id)?;
        let mut task = handle.lock();
        let current = task.state;
        match current {
            TaskState::Pending | TaskState::Blocked => {
                self.queue.remove(id);
                self.transition(
                    &mut task,
                    None,
                    TaskState::Cancelled,
                    TransitionCause::Cancelled,
                    Some("cancelled on request".into()),
                )?;
                drop(task);
                info!(workflow_id = %self.workflow_id, task_id = %id, "task cancelled");
                self.fail_dependents(id);
                Ok(TaskState::Cancelled)
            }
            TaskState::InProgress => {
                if !task.cancel_requested {
                    self.transition(
                        &mut task,
                        None,
                        TaskState::InProgress,
                        TransitionCause::CancelRequested,
                        None,
                    )?;
                    if let Some(agent_id) = task.assigned_agent.clone() {
                        self.publish(
                            &channels::agent_inbox(&agent_id),
                            Message::CancelRequested {
                                task_id: id.clone(),
                                agent_id,
                            },
                            Some(task.correlation_id),
                        );
                    }
                    info!(workflow_id = %self.workflow_id, task_id = %id, "cancellation requested");
                }
                Ok(TaskState::InProgress)
            }
            state => Err(ConductorError::TaskValidation(format!(
                "task '{id}' is already {state}"
            ))),
        }
    }

    pub fn task_status(&self, id: &TaskId) -> ConductorResult<Task> {
        Ok(self.task_handle(id)?.lock().clone())
    }

    /// Drop a finished task that nothing unfinished depends on.
    pub fn archive_task(&self, id: &TaskId) -> ConductorResult<()> {
        let at = self.clock.now();
        let ticket = self.tasks.archive_with(id, |_| {
            let ticket = self.sequencer.begin();
            self.record(
                ticket.seq(),
                WorkflowEvent::TaskArchived {
                    task_id: id.clone(),
                    at,
                },
            );
            Ok(ticket)
        })?;
        drop(ticket);
        info!(workflow_id = %self.workflow_id, task_id = %id, "task archived");
        Ok(())
    }

    // --- agents ----------------------------------------------------------

    pub fn register_agent(&self, spec: AgentSpec) -> ConductorResult<AgentId> {
        let id = spec.id.unwrap_or_else(AgentId::generate);
        if id.as_str().trim().is_empty() {
            return Err(ConductorError::AgentRegistration(
                "agent id must not be empty".into(),
            ));
        }
        if spec.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(ConductorError::AgentRegistration(
                "capability names must not be empty".into(),
            ));
        }

        let agent = Agent::new(id.clone(), spec.capabilities, self.clock.now());
        let ticket = self.agents.insert_with(agent, |agent| {
            let ticket = self.sequencer.begin();
            self.record(
                ticket.seq(),
                WorkflowEvent::AgentRegistered {
                    agent: agent.clone(),
                },
            );
            ticket
        })?;
        drop(ticket);

        info!(workflow_id = %self.workflow_id, agent_id = %id, "agent registered");
        self.publish(
            channels::AGENT_HEARTBEAT,
            Message::AgentHeartbeat {
                agent_id: id.clone(),
                status: AgentStatus::Active,
                load_factor: 0.0,
            },
            None,
        );
        Ok(id)
    }

    /// Take an agent out of rotation, hand its tasks back to the queue and
    /// forget it.
    pub fn deregister_agent(&self, id: &AgentId) -> ConductorResult<()> {
        let handle = self
            .agents
            .get(id)
            .ok_or_else(|| ConductorError::NotFound(format!("agent '{id}'")))?;

        let current: Vec<TaskId> = {
            let mut agent = handle.lock();
            if agent.status != AgentStatus::Offline {
                self.set_status(&mut agent, AgentStatus::Offline);
            }
            agent.current_tasks.iter().cloned().collect()
        };
        for task_id in &current {
            self.reassign(task_id, id, "agent deregistered");
        }

        let agent = handle.lock();
        if !self.is_current(id, &handle) {
            return Ok(());
        }
        let ticket = self.sequencer.begin();
        self.record(
            ticket.seq(),
            WorkflowEvent::AgentDeregistered {
                agent_id: id.clone(),
                at: self.clock.now(),
            },
        );
        self.agents.remove(id);
        drop(ticket);
        drop(agent);

        info!(
            workflow_id = %self.workflow_id,
            agent_id = %id,
            reassigned = current.len(),
            "agent deregistered"
        );
        Ok(())
    }

    /// Refresh an agent's heartbeat. Unknown agents are logged and ignored,
    /// never registered implicitly. Returns whether the agent is known.
    pub fn heartbeat(&self, agent_id: &AgentId) -> bool {
        let Some(handle) = self.agents.get(agent_id) else {
            warn!(workflow_id = %self.workflow_id, agent_id = %agent_id, "heartbeat from unknown agent");
            return false;
        };
        let mut agent = handle.lock();
        if !self.is_current(agent_id, &handle) {
            warn!(workflow_id = %self.workflow_id, agent_id = %agent_id, "heartbeat from deregistered agent");
            return false;
        }

        let previous = agent.status;
        let at = self.clock.now();
        let ticket = self.sequencer.begin();
        let version = agent.version + 1;
        apply_heartbeat(&mut agent, at, version);
        self.record(
            ticket.seq(),
            WorkflowEvent::AgentHeartbeat {
                agent_id: agent_id.clone(),
                at,
                agent_version: version,
            },
        );
        drop(ticket);

        if previous != AgentStatus::Active {
            info!(
                workflow_id = %self.workflow_id,
                agent_id = %agent_id,
                previous = %previous,
                "agent is back"
            );
        }
        self.publish(
            channels::AGENT_HEARTBEAT,
            Message::AgentHeartbeat {
                agent_id: agent_id.clone(),
                status: agent.status,
                load_factor: agent.load_factor,
            },
            None,
        );
        true
    }

    /// An agent finished a task. Duplicate reports are no-ops.
    pub fn complete_task(&self, task_id: &TaskId, agent_id: &AgentId) -> ConductorResult<()> {
        let handle = self.task_handle(task_id)?;
        {
            let mut task = handle.lock();
            if !self.check_report(&task, agent_id, "completion")? {
                return Ok(());
            }
            let agent_handle = self.agents.get(agent_id);
            let mut agent = agent_handle.as_ref().map(|h| h.lock());
            self.transition(
                &mut task,
                agent.as_deref_mut(),
                TaskState::Completed,
                TransitionCause::Completed,
                None,
            )?;
            info!(
                workflow_id = %self.workflow_id,
                task_id = %task_id,
                agent_id = %agent_id,
                correlation_id = %task.correlation_id,
                "task completed"
            );
        }
        self.reevaluate(task_id);
        Ok(())
    }

    /// An agent failed a task: retry it with a decayed score while the
    /// budget lasts, otherwise fail it and everything downstream.
    /// Returns the task's state after the call.
    pub fn fail_task(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        reason: impl Into<String>,
    ) -> ConductorResult<TaskState> {
        let reason = reason.into();
        let handle = self.task_handle(task_id)?;
        let outcome = {
            let mut task = handle.lock();
            if !self.check_report(&task, agent_id, "failure")? {
                return Ok(task.state);
            }
            let agent_handle = self.agents.get(agent_id);
            let mut agent = agent_handle.as_ref().map(|h| h.lock());
            self.settle_failure(&mut task, agent.as_deref_mut(), agent_id, reason, false)?
        };
        if outcome.is_terminal() {
            self.fail_dependents(task_id);
        }
        Ok(outcome)
    }

    /// An agent confirmed it stopped a task whose cancellation was requested.
    pub fn acknowledge_cancel(&self, task_id: &TaskId, agent_id: &AgentId) -> ConductorResult<()> {
        let handle = self.task_handle(task_id)?;
        {
            let mut task = handle.lock();
            if task.state == TaskState::Cancelled {
                debug!(workflow_id = %self.workflow_id, task_id = %task_id, "duplicate cancel acknowledgement");
                return Ok(());
            }
            if task.state != TaskState::InProgress
                || !task.cancel_requested
                || task.assigned_agent.as_ref() != Some(agent_id)
            {
                return Err(ConductorError::TaskValidation(format!(
                    "task '{task_id}' has no pending cancellation for agent '{agent_id}'"
                )));
            }
            let agent_handle = self.agents.get(agent_id);
            let mut agent = agent_handle.as_ref().map(|h| h.lock());
            self.transition(
                &mut task,
                agent.as_deref_mut(),
                TaskState::Cancelled,
                TransitionCause::Cancelled,
                Some("cancellation acknowledged".into()),
            )?;
            info!(workflow_id = %self.workflow_id, task_id = %task_id, agent_id = %agent_id, "task cancelled");
        }
        self.fail_dependents(task_id);
        Ok(())
    }

    /// Move every blocked dependent of `completed` whose dependencies are all
    /// done to pending and queue it. Returns the tasks that were unblocked.
    pub fn reevaluate(&self, completed: &TaskId) -> Vec<TaskId> {
        self.tasks
            .ready_dependents(completed)
            .into_iter()
            .filter(|id| self.unblock(id))
            .collect()
    }

    // --- background work ---------------------------------------------------

    /// One scheduling tick: dispatch up to `dispatch_batch` queued tasks.
    ///
    /// When the head task has no eligible agent it goes back to the queue
    /// unchanged and the tick ends. Returns the number of assignments.
    pub fn schedule_tick(&self) -> usize {
        let Some(_tick) = self.tick_lock.try_lock() else {
            return 0;
        };
        let mut assigned = 0;
        while assigned < self.config.coordination.dispatch_batch {
            let Some(entry) = self.queue.dequeue() else {
                break;
            };
            match self.try_assign(entry) {
                Dispatch::Assigned => assigned += 1,
                Dispatch::Skipped => {}
                Dispatch::NoAgent => break,
            }
        }
        assigned
    }

    /// One liveness sweep: silent active agents go stale and lose their
    /// tasks, long-silent stale agents go offline. Runs that outlast their
    /// timeout fail, and waiting tasks past their deadline are cancelled.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let stale_after = self.config.liveness.stale_after();
        let offline_after = self.config.liveness.offline_after();
        let mut report = SweepReport::default();

        for handle in self.agents.handles() {
            let (agent_id, orphaned) = {
                let mut agent = handle.lock();
                let verdict = liveness_verdict(&agent, now, stale_after, offline_after);
                match verdict {
                    Some(AgentStatus::Stale) => {
                        self.set_status(&mut agent, AgentStatus::Stale);
                        let err = ConductorError::AgentTimeout(format!(
                            "no heartbeat from '{}' since {}",
                            agent.id, agent.last_heartbeat
                        ));
                        warn!(
                            workflow_id = %self.workflow_id,
                            agent_id = %agent.id,
                            tasks = agent.current_tasks.len(),
                            error = %err,
                            "agent went stale"
                        );
                        report.stale.push(agent.id.clone());
                        let tasks: Vec<TaskId> = agent.current_tasks.iter().cloned().collect();
                        (agent.id.clone(), tasks)
                    }
                    Some(AgentStatus::Offline) => {
                        self.set_status(&mut agent, AgentStatus::Offline);
                        warn!(workflow_id = %self.workflow_id, agent_id = %agent.id, "agent went offline");
                        report.offline.push(agent.id.clone());
                        continue;
                    }
                    _ => continue,
                }
            };
            for task_id in orphaned {
                if self.reassign(&task_id, &agent_id, "agent heartbeat timed out") {
                    report.reassigned.push(task_id);
                }
            }
        }

        for handle in self.tasks.handles() {
            let Some(outcome) = self.enforce_limits(&handle, now) else {
                continue;
            };
            let id = handle.lock().id.clone();
            match outcome {
                Limit::TimedOut(state) => {
                    if state.is_terminal() {
                        self.fail_dependents(&id);
                    }
                    report.timed_out.push(id);
                }
                Limit::Expired => {
                    self.fail_dependents(&id);
                    report.expired.push(id);
                }
            }
        }

        self.assignment_limiter.cleanup();
        self.submission_limiter.cleanup();
        report
    }

    /// Write a snapshot if anything changed since the last one.
    /// Returns the version written.
    pub async fn snapshot(&self) -> ConductorResult<Option<u64>> {
        let _guard = self.snapshot_lock.lock().await;
        let version = self.sequencer.watermark();
        if version <= self.last_snapshot.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let snapshot = WorkflowSnapshot {
            workflow_id: self.workflow_id.clone(),
            version,
            timestamp: self.clock.now(),
            tasks: self.tasks.snapshot(),
            agents: self.agents.snapshot(),
        };

        let journal = self.config.persistence.journal();
        let written = retry_with_backoff(journal.write_retries, journal.backoff_base, || {
            self.store.write_snapshot(&snapshot)
        })
        .await;

        match written {
            Ok(()) => {
                self.last_snapshot.fetch_max(version, Ordering::SeqCst);
                if self.snapshot_failed.swap(false, Ordering::SeqCst) {
                    info!(workflow_id = %self.workflow_id, "snapshots recovered");
                }
                info!(
                    workflow_id = %self.workflow_id,
                    version,
                    tasks = snapshot.tasks.len(),
                    agents = snapshot.agents.len(),
                    "snapshot written"
                );
                Ok(Some(version))
            }
            Err(e) => {
                if !self.snapshot_failed.swap(true, Ordering::SeqCst) {
                    self.alert(format!("snapshot v{version} could not be written: {e}"));
                }
                Err(ConductorError::Persistence(format!(
                    "snapshot v{version} of '{}': {e}",
                    self.workflow_id
                )))
            }
        }
    }

    /// Wait for the journal to write everything recorded so far.
    pub async fn flush(&self) -> bool {
        self.journal.flush().await
    }

    // --- bus ---------------------------------------------------------------

    /// Listen for agent reports on the bus. Idempotent.
    pub fn attach(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        let subscriber = FnSubscriber::new(
            format!("coordinator/{}", self.workflow_id),
            move |envelope| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(manager) => manager.handle_agent_event(envelope),
                        None => Ok(()),
                    }
                }
            },
        );
        self.bus.subscribe(channels::AGENT_EVENTS, subscriber)
    }

    /// Apply one inbound agent report. Reports about tasks or agents this
    /// workflow does not know are ignored; the channel is shared.
    pub fn handle_agent_event(&self, envelope: Envelope) -> ConductorResult<()> {
        let result = match envelope.message {
            Message::Heartbeat { agent_id } => {
                if self.agents.contains(&agent_id) {
                    self.heartbeat(&agent_id);
                }
                Ok(())
            }
            Message::TaskCompleted { task_id, agent_id } => self.complete_task(&task_id, &agent_id),
            Message::TaskFailed {
                task_id,
                agent_id,
                reason,
            } => self.fail_task(&task_id, &agent_id, reason).map(|_| ()),
            Message::CancelAcknowledged { task_id, agent_id } => {
                self.acknowledge_cancel(&task_id, &agent_id)
            }
            other => {
                debug!(kind = other.kind(), "ignoring message on agent events channel");
                Ok(())
            }
        };
        match result {
            Err(ConductorError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    // --- inspection ----------------------------------------------------------

    pub fn agent(&self, id: &AgentId) -> Option<Agent> {
        self.agents.get(id).map(|h| h.lock().clone())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_score(&self, id: &TaskId) -> Option<f64> {
        self.queue.score_of(id)
    }

    /// Highest sequence number handed out so far.
    pub fn last_seq(&self) -> u64 {
        self.sequencer.last_issued()
    }

    /// Whether journal or snapshot writes are failing.
    pub fn is_degraded(&self) -> bool {
        self.journal.is_degraded() || self.snapshot_failed.load(Ordering::SeqCst)
    }

    pub fn journal_status(&self) -> JournalStatus {
        self.journal.status()
    }

    /// Plain copy of every task and agent.
    pub fn export_state(&self) -> WorkflowState {
        WorkflowState {
            tasks: self
                .tasks
                .snapshot()
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
            agents: self
                .agents
                .snapshot()
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
        }
    }

    // --- internals ---------------------------------------------------------

    fn task_handle(&self, id: &TaskId) -> ConductorResult<crate::task_store::TaskHandle> {
        self.tasks
            .get(id)
            .ok_or_else(|| ConductorError::NotFound(format!("task '{id}'")))
    }

    fn is_current(&self, id: &AgentId, handle: &AgentHandle) -> bool {
        self.agents
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(&current, handle))
    }

    fn score(&self, task: &Task) -> f64 {
        retry_score(
            task.priority.weight(),
            task.retry_count,
            self.retry.retry_penalty,
        )
    }

    /// Whether an agent report applies. `Ok(false)` for a duplicate of a
    /// report already applied.
    fn check_report(&self, task: &Task, agent_id: &AgentId, what: &str) -> ConductorResult<bool> {
        if task.state == TaskState::InProgress && task.assigned_agent.as_ref() == Some(agent_id) {
            return Ok(true);
        }
        if task.state.is_terminal() {
            debug!(
                workflow_id = %self.workflow_id,
                task_id = %task.id,
                agent_id = %agent_id,
                state = %task.state,
                "ignoring late {what}"
            );
            return Ok(false);
        }
        Err(ConductorError::TaskValidation(format!(
            "task '{}' is {} and not running on agent '{agent_id}'",
            task.id, task.state
        )))
    }

    fn record(&self, seq: u64, event: WorkflowEvent) {
        self.journal.append(LogRecord {
            workflow_id: self.workflow_id.clone(),
            seq,
            event,
        });
    }

    /// Apply and log one task transition, with the agent side when `agent`
    /// is given, then announce it on the task updates channel.
    fn transition(
        &self,
        task: &mut Task,
        agent: Option<&mut Agent>,
        to: TaskState,
        cause: TransitionCause,
        reason: Option<String>,
    ) -> ConductorResult<TaskHistoryEntry> {
        if !is_valid_transition(task.state, to, cause) {
            return Err(ConductorError::TaskValidation(format!(
                "illegal transition {} -> {to} ({cause:?}) for task '{}'",
                task.state, task.id
            )));
        }
        let ticket = self.sequencer.begin();
        let entry = TaskHistoryEntry {
            timestamp: self.clock.now(),
            task_id: task.id.clone(),
            from_state: task.state,
            to_state: to,
            agent: agent
                .as_ref()
                .map(|a| a.id.clone())
                .or_else(|| task.assigned_agent.clone()),
            cause,
            task_version: task.version + 1,
            agent_version: agent.as_ref().map(|a| a.version + 1),
            reason,
        };
        apply_to_task(task, &entry);
        if let Some(agent) = agent {
            apply_to_agent(agent, &entry, self.config.coordination.max_agent_load);
        }
        self.record(ticket.seq(), WorkflowEvent::Transition(entry.clone()));
        drop(ticket);

        self.publish(
            channels::TASK_UPDATES,
            Message::TaskUpdate {
                task_id: entry.task_id.clone(),
                from_state: entry.from_state,
                to_state: entry.to_state,
                timestamp: entry.timestamp,
            },
            Some(task.correlation_id),
        );
        Ok(entry)
    }

    fn set_status(&self, agent: &mut Agent, status: AgentStatus) {
        let ticket = self.sequencer.begin();
        let version = agent.version + 1;
        apply_status(agent, status, version);
        self.record(
            ticket.seq(),
            WorkflowEvent::AgentStatusChanged {
                agent_id: agent.id.clone(),
                status,
                at: self.clock.now(),
                agent_version: version,
            },
        );
        drop(ticket);
        self.publish(
            channels::AGENT_HEARTBEAT,
            Message::AgentHeartbeat {
                agent_id: agent.id.clone(),
                status,
                load_factor: agent.load_factor,
            },
            None,
        );
    }

    fn try_assign(&self, entry: QueueEntry) -> Dispatch {
        let Some(handle) = self.tasks.get(&entry.task_id) else {
            return Dispatch::Skipped;
        };
        let mut task = handle.lock();
        // Pending implies every dependency completed: tasks only reach it by
        // admission or unblocking, and completion is final.
        if task.state != TaskState::Pending {
            return Dispatch::Skipped;
        }
        if task.deadline_passed(self.clock.now()) {
            let expired = match self.expire(&mut task) {
                Ok(()) => true,
                Err(e) => {
                    error!(workflow_id = %self.workflow_id, task_id = %entry.task_id, error = %e, "deadline expiry failed");
                    false
                }
            };
            drop(task);
            if expired {
                self.fail_dependents(&entry.task_id);
            }
            return Dispatch::Skipped;
        }

        let max_load = self.config.coordination.max_agent_load;
        for agent_id in self.agents.candidates(&task.required_capabilities, max_load) {
            let Some(agent_handle) = self.agents.get(&agent_id) else {
                continue;
            };
            let mut agent = agent_handle.lock();
            if !is_eligible(&agent, &task.required_capabilities, max_load) {
                continue;
            }
            if !self.assignment_limiter.allow(agent_id.as_str()) {
                debug!(
                    workflow_id = %self.workflow_id,
                    agent_id = %agent_id,
                    "agent skipped by assignment rate limit"
                );
                continue;
            }

            if let Err(e) = self.transition(
                &mut task,
                Some(&mut *agent),
                TaskState::InProgress,
                TransitionCause::Assigned,
                None,
            ) {
                error!(workflow_id = %self.workflow_id, task_id = %entry.task_id, error = %e, "assignment failed");
                return Dispatch::Skipped;
            }
            self.publish(
                &channels::agent_inbox(&agent_id),
                Message::TaskAssigned {
                    task_id: task.id.clone(),
                    agent_id: agent_id.clone(),
                    priority: task.priority,
                    metadata: task.metadata.clone(),
                },
                Some(task.correlation_id),
            );
            info!(
                workflow_id = %self.workflow_id,
                task_id = %task.id,
                agent_id = %agent_id,
                load_factor = agent.load_factor,
                score = entry.score,
                "task assigned"
            );
            return Dispatch::Assigned;
        }

        let err = ConductorError::AgentUnavailable(format!(
            "no eligible agent for task '{}'",
            task.id
        ));
        debug!(workflow_id = %self.workflow_id, error = %err, "task stays queued");
        self.queue.restore(entry);
        Dispatch::NoAgent
    }

    /// Fail a run of `task` on `agent_id`: back to the queue while the retry
    /// budget allows, failed once it is spent. A task already asked to
    /// cancel ends cancelled.
    fn settle_failure(
        &self,
        task: &mut Task,
        agent: Option<&mut Agent>,
        agent_id: &AgentId,
        reason: String,
        timed_out: bool,
    ) -> ConductorResult<TaskState> {
        if task.cancel_requested {
            self.transition(
                task,
                agent,
                TaskState::Cancelled,
                TransitionCause::Cancelled,
                Some(reason),
            )?;
            return Ok(TaskState::Cancelled);
        }
        match self
            .retry
            .decide(task.priority.weight(), task.retry_count, task.max_retries)
        {
            RetryDecision::Requeue { .. } => {
                let cause = if timed_out {
                    TransitionCause::TimedOut
                } else {
                    TransitionCause::Retried
                };
                self.transition(task, agent, TaskState::Pending, cause, Some(reason.clone()))?;
                let score = self.queue.retry(
                    task.id.clone(),
                    task.priority.weight(),
                    task.retry_count,
                    self.retry.retry_penalty,
                );
                warn!(
                    workflow_id = %self.workflow_id,
                    task_id = %task.id,
                    agent_id = %agent_id,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    score,
                    reason = %reason,
                    "task failed, retrying"
                );
                Ok(TaskState::Pending)
            }
            RetryDecision::Exhausted => {
                let cause = if timed_out {
                    TransitionCause::TimedOut
                } else {
                    TransitionCause::RetriesExhausted
                };
                self.transition(task, agent, TaskState::Failed, cause, Some(reason.clone()))?;
                error!(
                    workflow_id = %self.workflow_id,
                    task_id = %task.id,
                    agent_id = %agent_id,
                    retry_count = task.retry_count,
                    reason = %reason,
                    "task failed, retries exhausted"
                );
                Ok(TaskState::Failed)
            }
        }
    }

    /// Cancel a task that is still waiting when its deadline passes. The
    /// caller cascades to dependents once the task lock is released.
    fn expire(&self, task: &mut Task) -> ConductorResult<()> {
        self.queue.remove(&task.id);
        let deadline = task.deadline.map(|d| d.to_rfc3339()).unwrap_or_default();
        self.transition(
            task,
            None,
            TaskState::Cancelled,
            TransitionCause::DeadlineExpired,
            Some(format!("deadline {deadline} passed before the task started")),
        )?;
        warn!(
            workflow_id = %self.workflow_id,
            task_id = %task.id,
            deadline = %deadline,
            "task deadline passed"
        );
        Ok(())
    }

    /// Handle one task whose run timed out or whose deadline passed.
    /// Returns `None` when neither applies.
    fn enforce_limits(&self, handle: &TaskHandle, now: DateTime<Utc>) -> Option<Limit> {
        let mut task = handle.lock();
        if task.deadline_passed(now) {
            if let Err(e) = self.expire(&mut task) {
                error!(workflow_id = %self.workflow_id, task_id = %task.id, error = %e, "deadline expiry failed");
                return None;
            }
            return Some(Limit::Expired);
        }
        if !task.run_timed_out(now) {
            return None;
        }
        let agent_id = task.assigned_agent.clone()?;
        let agent_handle = self.agents.get(&agent_id);
        let mut agent = agent_handle.as_ref().map(|h| h.lock());
        let reason = format!(
            "run exceeded its {}s timeout",
            task.timeout_secs.unwrap_or_default()
        );
        let outcome = match self.settle_failure(
            &mut task,
            agent.as_deref_mut(),
            &agent_id,
            reason,
            true,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(workflow_id = %self.workflow_id, task_id = %task.id, error = %e, "timeout handling failed");
                return None;
            }
        };
        // The agent may still be working on it; tell it to stop.
        self.publish(
            &channels::agent_inbox(&agent_id),
            Message::CancelRequested {
                task_id: task.id.clone(),
                agent_id: agent_id.clone(),
            },
            Some(task.correlation_id),
        );
        Some(Limit::TimedOut(outcome))
    }

    /// Take a running task back from `agent_id`. A task already asked to
    /// cancel ends cancelled instead of going back to the queue.
    ///
    /// The task re-enters the queue at the score it had before it was
    /// dispatched: its priority weight decayed only by failures it already
    /// counted. Losing an agent adds no penalty, and the score matches what
    /// recovery rebuilds for the same pending task.
    fn reassign(&self, task_id: &TaskId, agent_id: &AgentId, reason: &str) -> bool {
        let Some(handle) = self.tasks.get(task_id) else {
            return false;
        };
        let cancelled = {
            let mut task = handle.lock();
            if task.state != TaskState::InProgress || task.assigned_agent.as_ref() != Some(agent_id)
            {
                return false;
            }
            let agent_handle = self.agents.get(agent_id);
            let mut agent = agent_handle.as_ref().map(|h| h.lock());
            let (to, cause) = if task.cancel_requested {
                (TaskState::Cancelled, TransitionCause::Cancelled)
            } else {
                (TaskState::Pending, TransitionCause::Reassigned)
            };
            if let Err(e) = self.transition(&mut task, agent.as_deref_mut(), to, cause, Some(reason.into())) {
                error!(workflow_id = %self.workflow_id, task_id = %task_id, error = %e, "reassignment failed");
                return false;
            }
            if to == TaskState::Pending {
                self.queue.enqueue(task.id.clone(), self.score(&task));
            }
            info!(
                workflow_id = %self.workflow_id,
                task_id = %task_id,
                agent_id = %agent_id,
                to = %to,
                reason,
                "task taken back from agent"
            );
            to == TaskState::Cancelled
        };
        if cancelled {
            self.fail_dependents(task_id);
        }
        true
    }

    fn unblock(&self, id: &TaskId) -> bool {
        let Some(handle) = self.tasks.get(id) else {
            return false;
        };
        let mut task = handle.lock();
        if task.state != TaskState::Blocked {
            return false;
        }
        if let Err(e) = self.transition(
            &mut task,
            None,
            TaskState::Pending,
            TransitionCause::Unblocked,
            None,
        ) {
            error!(workflow_id = %self.workflow_id, task_id = %id, error = %e, "unblock failed");
            return false;
        }
        self.queue.enqueue(task.id.clone(), self.score(&task));
        info!(workflow_id = %self.workflow_id, task_id = %id, "task unblocked");
        true
    }

    /// Bring a blocked task in line with its dependencies' current states.
    fn settle_blocked(&self, id: &TaskId) {
        if let Some(dead) = self.tasks.has_dead_dependency(id) {
            if self.fail_blocked(id, &dead) {
                self.fail_dependents(id);
            }
        } else if self.tasks.dependencies_completed(id) {
            self.unblock(id);
        }
    }

    /// Fail everything downstream of a task that ended failed or cancelled.
    fn fail_dependents(&self, origin: &TaskId) {
        let mut frontier = vec![origin.clone()];
        while let Some(dead) = frontier.pop() {
            for dependent in self.tasks.dependents_of(&dead) {
                if self.fail_blocked(&dependent, &dead) {
                    frontier.push(dependent);
                }
            }
        }
    }

    fn fail_blocked(&self, id: &TaskId, dead: &TaskId) -> bool {
        let Some(handle) = self.tasks.get(id) else {
            return false;
        };
        let mut task = handle.lock();
        if !matches!(task.state, TaskState::Blocked | TaskState::Pending) {
            return false;
        }
        self.queue.remove(id);
        let reason = format!("dependency '{dead}' did not complete");
        if let Err(e) = self.transition(
            &mut task,
            None,
            TaskState::Failed,
            TransitionCause::DependencyFailed,
            Some(reason.clone()),
        ) {
            error!(workflow_id = %self.workflow_id, task_id = %id, error = %e, "dependency failure not applied");
            return false;
        }
        warn!(workflow_id = %self.workflow_id, task_id = %id, reason = %reason, "task can never run");
        true
    }

    fn publish(&self, channel: &str, message: Message, correlation_id: Option<Uuid>) {
        let envelope = match correlation_id {
            Some(id) => Envelope::new(message, id),
            None => Envelope::uncorrelated(message),
        };
        self.bus.publish(channel, envelope);
    }

    fn alert(&self, message: String) {
        error!(workflow_id = %self.workflow_id, alert = %message, "operator alert");
        self.publish(
            channels::OPERATOR_ALERTS,
            Message::OperatorAlert {
                workflow_id: self.workflow_id.clone(),
                message,
            },
            None,
        );
    }
}
