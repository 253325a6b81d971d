//! End-to-end coordination tests.
//!
//! Drives a [`CoordinationManager`] through full task lifecycles with a
//! manual clock: dependency gating, load-aware assignment, liveness
//! timeouts, retries, cancellation, rate limiting, bus-driven reports and
//! crash recovery from the journal.

use chrono::{TimeZone, Utc};
use conductor_channels::MessageBus;
use conductor_core::*;
use conductor_orchestrator::*;
use conductor_session::{recover, FileWorkflowStore, MemoryWorkflowStore, WorkflowStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    manager: Arc<CoordinationManager>,
    clock: Arc<ManualClock>,
    bus: Arc<MessageBus>,
}

fn harness_with(config: ConductorConfig, store: Arc<dyn WorkflowStore>) -> Harness {
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let bus = Arc::new(MessageBus::new());
    let manager = CoordinationManager::new(
        "wf-test",
        config,
        store,
        bus.clone(),
        clock.clone(),
    )
    .unwrap();
    Harness {
        manager: Arc::new(manager),
        clock,
        bus,
    }
}

fn harness(config: ConductorConfig) -> Harness {
    harness_with(config, Arc::new(MemoryWorkflowStore::new()))
}

fn task(id: &str) -> TaskSpec {
    TaskSpec::new().with_id(id)
}

fn state(h: &Harness, id: &str) -> TaskState {
    h.manager.task_status(&TaskId::new(id)).unwrap().state
}

fn assignee(h: &Harness, id: &str) -> Option<AgentId> {
    h.manager.task_status(&TaskId::new(id)).unwrap().assigned_agent
}

#[tokio::test]
async fn test_dependency_gates_dispatch() {
    let h = harness(ConductorConfig::default());
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();

    h.manager
        .submit_batch(vec![task("a"), task("b").depends_on("a")])
        .unwrap();
    assert_eq!(state(&h, "a"), TaskState::Pending);
    assert_eq!(state(&h, "b"), TaskState::Blocked);
    assert_eq!(h.manager.queue_len(), 1);

    assert_eq!(h.manager.schedule_tick(), 1);
    assert_eq!(assignee(&h, "a"), Some(w1.clone()));
    assert_eq!(h.manager.schedule_tick(), 0);
    assert_eq!(state(&h, "b"), TaskState::Blocked);

    h.manager.complete_task(&TaskId::new("a"), &w1).unwrap();
    assert_eq!(state(&h, "a"), TaskState::Completed);
    assert_eq!(state(&h, "b"), TaskState::Pending);

    assert_eq!(h.manager.schedule_tick(), 1);
    assert_eq!(state(&h, "b"), TaskState::InProgress);
}

#[tokio::test]
async fn test_submission_rejects_bad_graphs() {
    let h = harness(ConductorConfig::default());

    let err = h
        .manager
        .submit_batch(vec![task("x").depends_on("y"), task("y").depends_on("x")])
        .unwrap_err();
    assert!(matches!(err, ConductorError::TaskDependency(_)));
    assert_eq!(h.manager.task_count(), 0);

    let err = h
        .manager
        .submit_task(task("z").depends_on("missing"))
        .unwrap_err();
    assert!(matches!(err, ConductorError::TaskDependency(_)));

    h.manager.submit_task(task("dup")).unwrap();
    let err = h.manager.submit_task(task("dup")).unwrap_err();
    assert!(matches!(err, ConductorError::TaskValidation(_)));
    assert_eq!(h.manager.task_count(), 1);
}

#[tokio::test]
async fn test_blocked_task_goes_to_least_loaded_agent() {
    let h = harness(ConductorConfig::default());
    let a = h
        .manager
        .register_agent(AgentSpec::new("a").with_capability("general").with_capability("pin-a"))
        .unwrap();
    let b = h
        .manager
        .register_agent(AgentSpec::new("b").with_capability("general").with_capability("pin-b"))
        .unwrap();

    let mut fillers = vec![task("fill-a").requires("pin-a")];
    for i in 0..4 {
        fillers.push(task(&format!("fill-b{i}")).requires("pin-b"));
    }
    h.manager.submit_batch(fillers).unwrap();
    assert_eq!(h.manager.schedule_tick(), 5);
    assert_eq!(h.manager.agent(&a).unwrap().load_factor, 0.2);
    assert_eq!(h.manager.agent(&b).unwrap().load_factor, 0.8);

    h.manager
        .submit_batch(vec![
            task("A").requires("general"),
            task("B")
                .with_priority(Priority::High)
                .requires("general")
                .depends_on("A"),
        ])
        .unwrap();
    assert_eq!(h.manager.schedule_tick(), 1);
    assert_eq!(assignee(&h, "A"), Some(a.clone()));
    assert_eq!(state(&h, "B"), TaskState::Blocked);

    h.manager.complete_task(&TaskId::new("A"), &a).unwrap();
    assert_eq!(h.manager.agent(&a).unwrap().load_factor, 0.2);
    assert_eq!(state(&h, "B"), TaskState::Pending);

    assert_eq!(h.manager.schedule_tick(), 1);
    assert_eq!(assignee(&h, "B"), Some(a));
}

#[tokio::test]
async fn test_stale_agent_loses_its_tasks_once() {
    let h = harness(ConductorConfig::default());
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    h.manager.submit_task(task("t")).unwrap();
    h.manager.schedule_tick();
    assert_eq!(state(&h, "t"), TaskState::InProgress);

    h.clock.advance(Duration::from_secs(31));
    let report = h.manager.sweep();
    assert_eq!(report.stale, vec![w1.clone()]);
    assert_eq!(report.reassigned, vec![TaskId::new("t")]);

    let t = h.manager.task_status(&TaskId::new("t")).unwrap();
    assert_eq!(t.state, TaskState::Pending);
    assert_eq!(t.retry_count, 0);
    assert_eq!(h.manager.queue_score(&t.id), Some(Priority::Normal.weight()));
    assert_eq!(h.manager.agent(&w1).unwrap().status, AgentStatus::Stale);
    assert!(h.manager.agent(&w1).unwrap().current_tasks.is_empty());

    // A second sweep finds nothing new.
    assert_eq!(h.manager.sweep(), SweepReport::default());
    assert_eq!(h.manager.schedule_tick(), 0);

    assert!(h.manager.heartbeat(&w1));
    assert_eq!(h.manager.agent(&w1).unwrap().status, AgentStatus::Active);
    assert_eq!(h.manager.schedule_tick(), 1);

    // Silent again: stale first, offline only after the longer timeout.
    h.clock.advance(Duration::from_secs(31));
    assert_eq!(h.manager.sweep().stale, vec![w1.clone()]);
    h.clock.advance(Duration::from_secs(200));
    assert!(h.manager.sweep().offline.is_empty());
    h.clock.advance(Duration::from_secs(100));
    assert_eq!(h.manager.sweep().offline, vec![w1.clone()]);
    assert_eq!(h.manager.agent(&w1).unwrap().status, AgentStatus::Offline);

    assert!(!h.manager.heartbeat(&AgentId::new("ghost")));
}

#[tokio::test]
async fn test_retries_decay_then_fail_and_cascade() {
    let h = harness(ConductorConfig::default());
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    h.manager
        .submit_batch(vec![
            task("t").with_priority(Priority::Urgent).with_max_retries(2),
            task("after").depends_on("t"),
        ])
        .unwrap();
    let t = TaskId::new("t");
    assert_eq!(h.manager.queue_score(&t), Some(4.0));

    h.manager.schedule_tick();
    assert_eq!(
        h.manager.fail_task(&t, &w1, "boom").unwrap(),
        TaskState::Pending
    );
    assert_eq!(h.manager.queue_score(&t), Some(2.0));

    h.manager.schedule_tick();
    assert_eq!(
        h.manager.fail_task(&t, &w1, "boom").unwrap(),
        TaskState::Pending
    );
    assert_eq!(h.manager.queue_score(&t), Some(1.0));

    h.manager.schedule_tick();
    assert_eq!(
        h.manager.fail_task(&t, &w1, "boom again").unwrap(),
        TaskState::Failed
    );

    let failed = h.manager.task_status(&t).unwrap();
    assert_eq!(failed.retry_count, 2);
    assert_eq!(failed.last_error.as_deref(), Some("boom again"));
    assert!(h.manager.queue_score(&t).is_none());
    assert_eq!(state(&h, "after"), TaskState::Failed);
    assert!(h.manager.agent(&w1).unwrap().current_tasks.is_empty());

    // A late duplicate report changes nothing.
    assert_eq!(
        h.manager.fail_task(&t, &w1, "late").unwrap(),
        TaskState::Failed
    );
}

#[tokio::test]
async fn test_reassignment_keeps_the_queued_score() {
    let h = harness(ConductorConfig::default());
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    let t = h
        .manager
        .submit_task(task("t").with_priority(Priority::Urgent))
        .unwrap();
    h.manager.schedule_tick();
    h.manager.fail_task(&t, &w1, "boom").unwrap();
    assert_eq!(h.manager.queue_score(&t), Some(2.0));

    h.manager.schedule_tick();
    h.clock.advance(Duration::from_secs(31));
    assert_eq!(h.manager.sweep().reassigned, vec![t.clone()]);

    let task = h.manager.task_status(&t).unwrap();
    assert_eq!(task.priority, Priority::Urgent);
    assert_eq!(task.retry_count, 1);
    assert_eq!(h.manager.queue_score(&t), Some(2.0));
}

#[tokio::test]
async fn test_run_timeout_counts_as_failure() {
    let mut config = ConductorConfig::default();
    config.liveness.stale_after_secs = 3600;
    config.liveness.offline_after_secs = 7200;
    let h = harness(config);
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    let mut inbox = h
        .bus
        .listen(&channels::agent_inbox(&w1), "test-inbox")
        .unwrap();
    h.manager
        .submit_batch(vec![
            task("slow")
                .with_timeout(Duration::from_secs(60))
                .with_max_retries(1),
            task("after").depends_on("slow"),
        ])
        .unwrap();
    let slow = TaskId::new("slow");
    h.manager.schedule_tick();
    assert_eq!(state(&h, "slow"), TaskState::InProgress);

    h.clock.advance(Duration::from_secs(59));
    assert!(h.manager.sweep().timed_out.is_empty());

    h.clock.advance(Duration::from_secs(1));
    let report = h.manager.sweep();
    assert_eq!(report.timed_out, vec![slow.clone()]);
    let t = h.manager.task_status(&slow).unwrap();
    assert_eq!(t.state, TaskState::Pending);
    assert_eq!(t.retry_count, 1);
    assert!(t.last_error.unwrap().contains("timeout"));
    assert!(h.manager.agent(&w1).unwrap().current_tasks.is_empty());
    assert_eq!(h.manager.queue_score(&slow), Some(1.0));

    // The agent is told to stop the abandoned run.
    let mut kinds = Vec::new();
    while let Ok(envelope) = inbox.try_recv() {
        kinds.push(envelope.message.kind());
    }
    assert_eq!(kinds, vec!["task_assigned", "cancel_requested"]);

    // The second run also times out and spends the budget.
    h.manager.schedule_tick();
    h.clock.advance(Duration::from_secs(61));
    assert_eq!(h.manager.sweep().timed_out, vec![slow.clone()]);
    assert_eq!(state(&h, "slow"), TaskState::Failed);
    assert_eq!(state(&h, "after"), TaskState::Failed);
    assert!(h.manager.sweep().timed_out.is_empty());
}

#[tokio::test]
async fn test_deadline_cancels_waiting_tasks() {
    let h = harness(ConductorConfig::default());
    let start = h.clock.now();
    h.manager
        .submit_batch(vec![
            task("early").with_deadline(start + chrono::Duration::seconds(20)),
            task("later").depends_on("early"),
            task("relaxed").with_deadline(start + chrono::Duration::seconds(3600)),
        ])
        .unwrap();

    h.clock.advance(Duration::from_secs(19));
    assert!(h.manager.sweep().expired.is_empty());

    h.clock.advance(Duration::from_secs(1));
    let report = h.manager.sweep();
    assert_eq!(report.expired, vec![TaskId::new("early")]);
    assert_eq!(state(&h, "early"), TaskState::Cancelled);
    assert_eq!(state(&h, "later"), TaskState::Failed);
    assert_eq!(state(&h, "relaxed"), TaskState::Pending);
    assert!(h.manager.queue_score(&TaskId::new("early")).is_none());

    // Already past its deadline at submission.
    let err = h
        .manager
        .submit_task(task("late").with_deadline(start))
        .unwrap_err();
    assert!(matches!(err, ConductorError::TaskValidation(_)));
}

#[tokio::test]
async fn test_tick_does_not_start_an_expired_task() {
    let h = harness(ConductorConfig::default());
    let start = h.clock.now();
    h.manager
        .submit_task(task("t").with_deadline(start + chrono::Duration::seconds(5)))
        .unwrap();
    h.clock.advance(Duration::from_secs(10));
    h.manager.register_agent(AgentSpec::new("w1")).unwrap();

    assert_eq!(h.manager.schedule_tick(), 0);
    assert_eq!(state(&h, "t"), TaskState::Cancelled);
    assert_eq!(h.manager.queue_len(), 0);
}

#[tokio::test]
async fn test_cancel_pending_and_blocked() {
    let h = harness(ConductorConfig::default());
    h.manager
        .submit_batch(vec![task("a"), task("b").depends_on("a")])
        .unwrap();

    assert_eq!(
        h.manager.cancel_task(&TaskId::new("a")).unwrap(),
        TaskState::Cancelled
    );
    assert_eq!(h.manager.queue_len(), 0);
    assert_eq!(state(&h, "b"), TaskState::Failed);

    let err = h.manager.cancel_task(&TaskId::new("a")).unwrap_err();
    assert!(matches!(err, ConductorError::TaskValidation(_)));
    let err = h.manager.cancel_task(&TaskId::new("nope")).unwrap_err();
    assert!(matches!(err, ConductorError::NotFound(_)));

    let err = h.manager.submit_task(task("c").depends_on("a")).unwrap_err();
    assert!(matches!(err, ConductorError::TaskDependency(_)));
}

#[tokio::test]
async fn test_cancel_running_task_waits_for_acknowledgement() {
    let h = harness(ConductorConfig::default());
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    let mut inbox = h.bus.listen(&channels::agent_inbox(&w1), "test").unwrap();

    h.manager.submit_task(task("t")).unwrap();
    h.manager.schedule_tick();
    let assigned = inbox.recv().await.unwrap();
    assert_eq!(assigned.message.kind(), "task_assigned");

    let t = TaskId::new("t");
    assert_eq!(h.manager.cancel_task(&t).unwrap(), TaskState::InProgress);
    assert_eq!(h.manager.cancel_task(&t).unwrap(), TaskState::InProgress);
    let cancel = inbox.recv().await.unwrap();
    assert_eq!(cancel.message.kind(), "cancel_requested");
    assert_eq!(cancel.correlation_id, assigned.correlation_id);
    assert!(inbox.try_recv().is_err());
    assert!(h.manager.task_status(&t).unwrap().cancel_requested);

    h.manager.acknowledge_cancel(&t, &w1).unwrap();
    assert_eq!(state(&h, "t"), TaskState::Cancelled);
    assert!(h.manager.agent(&w1).unwrap().current_tasks.is_empty());
    h.manager.acknowledge_cancel(&t, &w1).unwrap();
}

#[tokio::test]
async fn test_failure_after_cancel_request_cancels() {
    let h = harness(ConductorConfig::default());
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    h.manager.submit_task(task("t")).unwrap();
    h.manager.schedule_tick();
    let t = TaskId::new("t");
    h.manager.cancel_task(&t).unwrap();

    assert_eq!(
        h.manager.fail_task(&t, &w1, "interrupted").unwrap(),
        TaskState::Cancelled
    );
    assert_eq!(h.manager.queue_len(), 0);
}

#[tokio::test]
async fn test_rate_limited_agent_is_skipped() {
    let mut config = ConductorConfig::default();
    config.rate_limit.assignment = RateLimitConfig {
        max_requests: 1,
        window_secs: 60,
    };
    let h = harness(config);
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    h.clock.advance(Duration::from_secs(1));
    let w2 = h.manager.register_agent(AgentSpec::new("w2")).unwrap();

    h.manager.submit_task(task("first")).unwrap();
    h.manager.schedule_tick();
    assert_eq!(assignee(&h, "first"), Some(w1.clone()));
    h.manager.complete_task(&TaskId::new("first"), &w1).unwrap();

    // w1 is idle again and ranks first, but has used its assignment budget.
    h.manager.submit_task(task("second")).unwrap();
    assert_eq!(h.manager.schedule_tick(), 1);
    assert_eq!(assignee(&h, "second"), Some(w2.clone()));

    // Both are now limited; the task waits in the queue.
    h.manager.submit_task(task("third")).unwrap();
    assert_eq!(h.manager.schedule_tick(), 0);
    assert_eq!(state(&h, "third"), TaskState::Pending);

    h.clock.advance(Duration::from_secs(61));
    assert_eq!(h.manager.schedule_tick(), 1);
    assert_eq!(assignee(&h, "third"), Some(w1));
}

#[tokio::test]
async fn test_head_without_agent_keeps_its_place() {
    let h = harness(ConductorConfig::default());
    h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    h.manager
        .submit_batch(vec![
            task("needs-gpu").with_priority(Priority::Urgent).requires("gpu"),
            task("plain"),
        ])
        .unwrap();

    assert_eq!(h.manager.schedule_tick(), 0);
    assert_eq!(h.manager.queue_len(), 2);
    assert_eq!(h.manager.queue_score(&TaskId::new("needs-gpu")), Some(4.0));

    let gpu = h
        .manager
        .register_agent(AgentSpec::new("gpu-1").with_capability("gpu"))
        .unwrap();
    assert_eq!(h.manager.schedule_tick(), 2);
    assert_eq!(assignee(&h, "needs-gpu"), Some(gpu));
}

#[tokio::test]
async fn test_deregistration_requeues_work() {
    let h = harness(ConductorConfig::default());
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    h.manager.submit_task(task("t")).unwrap();
    h.manager.schedule_tick();

    h.manager.deregister_agent(&w1).unwrap();
    assert!(h.manager.agent(&w1).is_none());
    assert_eq!(state(&h, "t"), TaskState::Pending);
    assert_eq!(h.manager.queue_len(), 1);

    let err = h.manager.register_agent(AgentSpec::new("")).unwrap_err();
    assert!(matches!(err, ConductorError::AgentRegistration(_)));
    h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    let err = h.manager.register_agent(AgentSpec::new("w1")).unwrap_err();
    assert!(matches!(err, ConductorError::AgentRegistration(_)));
}

#[tokio::test]
async fn test_archive_only_finished_leaves() {
    let h = harness(ConductorConfig::default());
    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    h.manager
        .submit_batch(vec![task("a"), task("b").depends_on("a")])
        .unwrap();
    let a = TaskId::new("a");

    assert!(h.manager.archive_task(&a).is_err());
    h.manager.schedule_tick();
    h.manager.complete_task(&a, &w1).unwrap();
    // b is pending and still needs a.
    assert!(h.manager.archive_task(&a).is_err());

    h.manager.schedule_tick();
    h.manager.complete_task(&TaskId::new("b"), &w1).unwrap();
    h.manager.archive_task(&TaskId::new("b")).unwrap();
    h.manager.archive_task(&a).unwrap();
    assert_eq!(h.manager.task_count(), 0);
}

#[tokio::test]
async fn test_agent_reports_over_the_bus() {
    let h = harness(ConductorConfig::default());
    assert!(h.manager.attach());
    assert!(!h.manager.attach());
    let mut updates = h.bus.listen(channels::TASK_UPDATES, "observer").unwrap();

    let w1 = h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    let id = h.manager.submit_task(task("t")).unwrap();
    let correlation_id = h.manager.task_status(&id).unwrap().correlation_id;
    h.manager.schedule_tick();

    h.bus.publish(
        channels::AGENT_EVENTS,
        Envelope::new(
            Message::TaskCompleted {
                task_id: id.clone(),
                agent_id: w1.clone(),
            },
            correlation_id,
        ),
    );

    let mut done = false;
    for _ in 0..200 {
        if state(&h, "t") == TaskState::Completed {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(done, "completion was not applied");

    let mut seen = Vec::new();
    while let Ok(envelope) = updates.try_recv() {
        assert_eq!(envelope.correlation_id, correlation_id);
        if let Message::TaskUpdate { to_state, .. } = envelope.message {
            seen.push(to_state);
        }
    }
    assert_eq!(seen, vec![TaskState::InProgress, TaskState::Completed]);

    // Reports about unknown tasks are ignored.
    h.manager
        .handle_agent_event(Envelope::uncorrelated(Message::TaskCompleted {
            task_id: TaskId::new("elsewhere"),
            agent_id: w1,
        }))
        .unwrap();
}

#[tokio::test]
async fn test_recovered_state_matches_live_state() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn WorkflowStore> = Arc::new(
        FileWorkflowStore::new(tmp.path().join("workflows"))
            .await
            .unwrap(),
    );
    let mut config = ConductorConfig::default();
    config.coordination.default_max_retries = 1;
    let h = harness_with(config.clone(), store.clone());

    let w1 = h
        .manager
        .register_agent(AgentSpec::new("w1").with_capability("general"))
        .unwrap();
    let w2 = h
        .manager
        .register_agent(AgentSpec::new("w2").with_capability("general"))
        .unwrap();
    h.manager
        .submit_batch(vec![
            task("a").with_priority(Priority::High),
            task("b").depends_on("a"),
            task("c"),
            task("d").depends_on("c"),
        ])
        .unwrap();
    h.manager.schedule_tick();
    let a = TaskId::new("a");
    let a_agent = assignee(&h, "a").unwrap();
    h.manager.complete_task(&a, &a_agent).unwrap();

    assert!(h.manager.snapshot().await.unwrap().is_some());
    assert!(h.manager.snapshot().await.unwrap().is_none());

    let c = TaskId::new("c");
    let c_agent = assignee(&h, "c").unwrap();
    h.manager.fail_task(&c, &c_agent, "flaky").unwrap();
    h.clock.advance(Duration::from_secs(10));
    h.manager.heartbeat(&w1);
    h.manager.heartbeat(&w2);
    h.manager.schedule_tick();
    let c_agent = assignee(&h, "c").unwrap();
    h.manager.fail_task(&c, &c_agent, "flaky again").unwrap();
    assert_eq!(state(&h, "d"), TaskState::Failed);

    assert!(h.manager.flush().await);
    let live = h.manager.export_state();

    let recovered = recover(store.as_ref(), "wf-test", config.coordination.max_agent_load)
        .await
        .unwrap();
    assert!(recovered.report.is_clean());
    assert!(recovered.report.snapshot_version.is_some());
    assert_eq!(recovered.report.last_seq, h.manager.last_seq());
    assert_eq!(recovered.state, live);

    let (reopened, report) = CoordinationManager::open(
        "wf-test",
        config,
        store.clone(),
        Arc::new(MessageBus::new()),
        h.clock.clone(),
    )
    .await
    .unwrap();
    assert!(report.is_clean());
    assert_eq!(reopened.export_state(), live);
    assert_eq!(reopened.queue_len(), h.manager.queue_len());
    assert_eq!(reopened.last_seq(), h.manager.last_seq());
}

#[tokio::test]
async fn test_snapshots_resume_past_a_damaged_one() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("workflows");
    let store: Arc<dyn WorkflowStore> = Arc::new(FileWorkflowStore::new(dir.clone()).await.unwrap());
    let config = ConductorConfig::default();
    let h = harness_with(config.clone(), store.clone());

    h.manager.register_agent(AgentSpec::new("w1")).unwrap();
    assert_eq!(h.manager.snapshot().await.unwrap(), Some(1));
    h.manager.register_agent(AgentSpec::new("w2")).unwrap();
    assert_eq!(h.manager.snapshot().await.unwrap(), Some(2));
    assert!(h.manager.flush().await);

    let newest = dir
        .join("wf-test")
        .join("snapshots")
        .join(format!("{:020}.json", 2));
    tokio::fs::write(&newest, b"{\"workflow_id\": \"wf-te").await.unwrap();

    let (reopened, report) = CoordinationManager::open(
        "wf-test",
        config,
        store.clone(),
        Arc::new(MessageBus::new()),
        h.clock.clone(),
    )
    .await
    .unwrap();
    assert_eq!(report.snapshot_version, Some(1));
    assert_eq!(reopened.agent_count(), 2);

    assert_eq!(reopened.snapshot().await.unwrap(), None);
    assert!(!reopened.is_degraded());

    reopened.register_agent(AgentSpec::new("w3")).unwrap();
    assert_eq!(reopened.snapshot().await.unwrap(), Some(3));
    assert!(!reopened.is_degraded());
    assert_eq!(store.snapshot_versions("wf-test").await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_traffic_keeps_invariants() {
    const CHAINS: usize = 4;
    const CHAIN_LEN: usize = 60;
    const LOOSE: usize = 40;

    let store = Arc::new(MemoryWorkflowStore::new());
    let mut config = ConductorConfig::default();
    config.coordination.max_agent_load = 3;
    config.rate_limit.assignment.max_requests = 1_000_000;
    config.rate_limit.submission.max_requests = 1_000_000;
    let h = harness_with(config.clone(), store.clone());
    let m = h.manager.clone();
    let agents: Vec<AgentId> = (0..4)
        .map(|i| m.register_agent(AgentSpec::new(format!("w{i}"))).unwrap())
        .collect();
    let done = Arc::new(AtomicBool::new(false));
    let mut loops = Vec::new();

    // Chains: each link depends on the one before it.
    let mut submitters = Vec::new();
    for c in 0..CHAINS {
        let m = m.clone();
        submitters.push(tokio::spawn(async move {
            for i in 0..CHAIN_LEN {
                let mut spec = task(&format!("c{c}-{i}"));
                if i > 0 {
                    spec = spec.depends_on(format!("c{c}-{}", i - 1));
                }
                m.submit_task(spec).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    {
        let m = m.clone();
        submitters.push(tokio::spawn(async move {
            for i in 0..LOOSE {
                let id = m.submit_task(task(&format!("x{i}"))).unwrap();
                tokio::task::yield_now().await;
                if i % 3 == 0 {
                    let _ = m.cancel_task(&id);
                }
            }
        }));
    }

    {
        let (m, done) = (m.clone(), done.clone());
        loops.push(tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                m.schedule_tick();
                tokio::task::yield_now().await;
            }
        }));
    }
    {
        // Liveness: w0 heartbeats rarely, so it keeps going stale.
        let (m, clock, done, agents) = (m.clone(), h.clock.clone(), done.clone(), agents.clone());
        loops.push(tokio::spawn(async move {
            let mut round = 0u64;
            while !done.load(Ordering::SeqCst) {
                clock.advance(Duration::from_secs(1));
                m.sweep();
                for (i, agent) in agents.iter().enumerate() {
                    if i > 0 || round % 40 == 0 {
                        m.heartbeat(agent);
                    }
                }
                round += 1;
                tokio::task::yield_now().await;
            }
        }));
    }
    for agent in &agents {
        let (m, done, agent) = (m.clone(), done.clone(), agent.clone());
        loops.push(tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let running = m.agent(&agent).map(|a| a.current_tasks).unwrap_or_default();
                for id in running {
                    let Ok(t) = m.task_status(&id) else { continue };
                    // Every fifth task fails its first run.
                    let flaky = id.as_str().ends_with('0') || id.as_str().ends_with('5');
                    if flaky && t.retry_count == 0 {
                        let _ = m.fail_task(&id, &agent, "flaky");
                    } else {
                        let _ = m.complete_task(&id, &agent);
                    }
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for submitter in submitters {
        submitter.await.unwrap();
    }
    let expected = CHAINS * CHAIN_LEN + LOOSE;
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let state = m.export_state();
            if state.tasks.len() == expected && state.tasks.values().all(|t| t.state.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    done.store(true, Ordering::SeqCst);
    for handle in loops {
        handle.await.unwrap();
    }

    let live = m.export_state();
    for t in live.tasks.values() {
        assert_eq!(t.assigned_agent.is_some(), t.state == TaskState::InProgress, "{}", t.id);
        if matches!(t.state, TaskState::InProgress | TaskState::Completed) {
            for dep in &t.dependencies {
                let dep = &live.tasks[dep];
                assert_eq!(dep.state, TaskState::Completed, "{} ran before {}", t.id, dep.id);
                assert!(t.started_at >= dep.completed_at, "{} started early", t.id);
            }
        }
        if t.state == TaskState::Blocked {
            assert!(t
                .dependencies
                .iter()
                .any(|d| live.tasks[d].state != TaskState::Completed));
        }
        if t.id.as_str().starts_with('c') {
            assert_eq!(t.state, TaskState::Completed, "{}", t.id);
        }
    }
    for agent in live.agents.values() {
        assert!(agent.current_tasks.is_empty(), "{} still holds work", agent.id);
    }
    assert_eq!(m.queue_len(), 0);

    assert!(m.flush().await);
    let recovered = recover(store.as_ref(), "wf-test", config.coordination.max_agent_load)
        .await
        .unwrap();
    assert!(recovered.report.is_clean());
    assert_eq!(recovered.state, live);
}

#[tokio::test]
async fn test_host_isolates_a_broken_workflow() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("workflows");
    let store: Arc<dyn WorkflowStore> =
        Arc::new(FileWorkflowStore::new(dir.clone()).await.unwrap());
    let clock = Arc::new(ManualClock::default());
    {
        let manager = CoordinationManager::new(
            "healthy",
            ConductorConfig::default(),
            store.clone(),
            Arc::new(MessageBus::new()),
            clock.clone(),
        )
        .unwrap();
        manager.register_agent(AgentSpec::new("w1")).unwrap();
        manager.submit_task(task("t")).unwrap();
        assert!(manager.flush().await);
    }
    // An unreadable log makes recovery of this workflow fail.
    tokio::fs::create_dir_all(dir.join("broken").join("events.jsonl"))
        .await
        .unwrap();

    let bus = Arc::new(MessageBus::new());
    let mut alerts = bus.listen(channels::OPERATOR_ALERTS, "test").unwrap();
    let host = WorkflowHost::new(ConductorConfig::default(), store, bus, clock);

    let outcome = host.recover_all().await.unwrap();
    assert_eq!(outcome.recovered.len(), 1);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "broken");
    assert_eq!(host.workflow_ids(), vec!["healthy".to_string()]);
    let alert = alerts.recv().await.unwrap();
    assert_eq!(alert.message.kind(), "operator_alert");

    let healthy = host.get("healthy").unwrap();
    assert_eq!(healthy.queue_len(), 1);
    assert_eq!(healthy.schedule_tick(), 1);

    host.start();
    host.shutdown().await;
}
