use crate::store::WorkflowStore;
use conductor_core::{ApplyOutcome, ConductorResult, WorkflowState};
use tracing::{error, info, warn};

/// A hole or unreadable stretch found while replaying a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayGap {
    /// Last sequence number applied before the gap.
    pub after_seq: u64,
    /// Log line, when the gap is a damaged record.
    pub line: Option<usize>,
    pub detail: String,
}

/// What recovery did for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub workflow_id: String,
    pub snapshot_version: Option<u64>,
    /// Highest sequence number seen; new records continue after it.
    pub last_seq: u64,
    pub replayed: usize,
    /// Records the state already reflected (snapshot overlap or re-written lines).
    pub skipped_duplicates: usize,
    /// Records referring to tasks or agents the state does not hold.
    pub orphaned: usize,
    pub gaps: Vec<ReplayGap>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.gaps.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RecoveredWorkflow {
    pub state: WorkflowState,
    pub report: RecoveryReport,
}

/// Rebuilds a workflow from its latest readable snapshot plus the log tail.
///
/// Gaps and damaged records are logged and reported but do not abort the
/// recovery; the caller decides whether a workflow with gaps may resume.
pub async fn recover(
    store: &dyn WorkflowStore,
    workflow_id: &str,
    max_agent_load: usize,
) -> ConductorResult<RecoveredWorkflow> {
    let snapshot = store.latest_snapshot(workflow_id).await?;
    let base = snapshot.as_ref().map(|s| s.version).unwrap_or(0);
    let mut report = RecoveryReport {
        workflow_id: workflow_id.to_string(),
        snapshot_version: snapshot.as_ref().map(|s| s.version),
        last_seq: base,
        ..Default::default()
    };
    let mut state = snapshot.map(WorkflowState::from).unwrap_or_default();

    let log = store.read_log(workflow_id, base).await?;
    for damaged in &log.damaged {
        error!(
            workflow_id = %workflow_id,
            line = damaged.line,
            error = %damaged.error,
            "damaged log record"
        );
        report.gaps.push(ReplayGap {
            after_seq: 0,
            line: Some(damaged.line),
            detail: damaged.error.clone(),
        });
    }

    let mut records = log.records;
    records.sort_by_key(|r| r.seq);

    for record in &records {
        if record.seq <= report.last_seq {
            report.skipped_duplicates += 1;
            continue;
        }
        if record.seq > report.last_seq + 1 {
            let missing = record.seq - report.last_seq - 1;
            error!(
                workflow_id = %workflow_id,
                after_seq = report.last_seq,
                missing,
                "gap in event log"
            );
            report.gaps.push(ReplayGap {
                after_seq: report.last_seq,
                line: None,
                detail: format!("{missing} record(s) missing before seq {}", record.seq),
            });
        }

        match state.apply(&record.event, max_agent_load) {
            ApplyOutcome::Applied => report.replayed += 1,
            ApplyOutcome::AlreadyApplied => report.skipped_duplicates += 1,
            ApplyOutcome::UnknownTask(id) => {
                warn!(workflow_id = %workflow_id, seq = record.seq, task_id = %id, "log record for unknown task");
                report.orphaned += 1;
            }
            ApplyOutcome::UnknownAgent(id) => {
                warn!(workflow_id = %workflow_id, seq = record.seq, agent_id = %id, "log record for unknown agent");
                report.orphaned += 1;
            }
        }
        report.last_seq = record.seq;
    }

    info!(
        workflow_id = %workflow_id,
        snapshot_version = ?report.snapshot_version,
        last_seq = report.last_seq,
        replayed = report.replayed,
        gaps = report.gaps.len(),
        tasks = state.tasks.len(),
        agents = state.agents.len(),
        "workflow recovered"
    );

    Ok(RecoveredWorkflow { state, report })
}
