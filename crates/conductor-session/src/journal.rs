use crate::store::WorkflowStore;
use conductor_core::{ConductorResult, LogRecord};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Called with a human-readable message when the journal becomes degraded.
pub type AlertHook = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Attempts per write before the journal reports itself degraded.
    pub write_retries: u32,
    /// First back-off delay; doubles on every further attempt.
    pub backoff_base: Duration,
    /// How long a degraded journal waits before trying its backlog again.
    pub retry_interval: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            write_retries: 5,
            backoff_base: Duration::from_millis(100),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Runs `op` up to `attempts` times with exponential back-off between tries.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    base: Duration,
    mut op: F,
) -> ConductorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ConductorResult<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = base;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(attempt, error = %e, "write failed, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Default)]
struct JournalHealth {
    degraded: AtomicBool,
    failed_writes: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time view of a journal's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalStatus {
    pub degraded: bool,
    pub failed_writes: u64,
    pub last_error: Option<String>,
}

enum Command {
    Append(LogRecord),
    Flush(oneshot::Sender<bool>),
}

/// Background writer for one workflow's event log.
///
/// `append` only queues; a spawned task batches queued records and writes
/// them in order. A batch that still fails after every retry stays queued,
/// the journal turns degraded and the alert hook fires. Coordination carries
/// on in memory meanwhile, and the backlog is retried until a write
/// succeeds.
pub struct Journal {
    workflow_id: String,
    tx: mpsc::UnboundedSender<Command>,
    health: Arc<JournalHealth>,
}

impl Journal {
    /// Spawn the writer task. Must be called from within a Tokio runtime.
    pub fn spawn(
        workflow_id: impl Into<String>,
        store: Arc<dyn WorkflowStore>,
        config: JournalConfig,
        alert: Option<AlertHook>,
    ) -> Self {
        let workflow_id = workflow_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let health = Arc::new(JournalHealth::default());

        let writer = Writer {
            workflow_id: workflow_id.clone(),
            store,
            config,
            alert,
            health: health.clone(),
            pending: Vec::new(),
        };
        tokio::spawn(writer.run(rx));

        Self {
            workflow_id,
            tx,
            health,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Queue a record. Never blocks.
    pub fn append(&self, record: LogRecord) {
        if self.tx.send(Command::Append(record)).is_err() {
            error!(workflow_id = %self.workflow_id, "journal writer has stopped; record lost");
        }
    }

    /// Wait until everything queued so far has been attempted.
    /// Returns `true` when nothing is left unwritten.
    pub async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn is_degraded(&self) -> bool {
        self.health.degraded.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> JournalStatus {
        JournalStatus {
            degraded: self.is_degraded(),
            failed_writes: self.health.failed_writes.load(Ordering::SeqCst),
            last_error: self.health.last_error.lock().clone(),
        }
    }
}

struct Writer {
    workflow_id: String,
    store: Arc<dyn WorkflowStore>,
    config: JournalConfig,
    alert: Option<AlertHook>,
    health: Arc<JournalHealth>,
    pending: Vec<LogRecord>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = if self.pending.is_empty() {
                rx.recv().await
            } else {
                match tokio::time::timeout(self.config.retry_interval, rx.recv()).await {
                    Ok(command) => command,
                    Err(_) => {
                        self.write_pending().await;
                        continue;
                    }
                }
            };
            let Some(command) = command else {
                break;
            };

            let mut waiters = Vec::new();
            self.accept(command, &mut waiters);
            while let Ok(command) = rx.try_recv() {
                self.accept(command, &mut waiters);
            }

            self.write_pending().await;
            let clean = self.pending.is_empty();
            for waiter in waiters {
                let _ = waiter.send(clean);
            }
        }

        if !self.pending.is_empty() {
            self.write_pending().await;
            if !self.pending.is_empty() {
                error!(
                    workflow_id = %self.workflow_id,
                    lost = self.pending.len(),
                    "journal closed with unwritten records"
                );
            }
        }
    }

    fn accept(&mut self, command: Command, waiters: &mut Vec<oneshot::Sender<bool>>) {
        match command {
            Command::Append(record) => self.pending.push(record),
            Command::Flush(tx) => waiters.push(tx),
        }
    }

    async fn write_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let store = self.store.clone();
        let workflow_id = self.workflow_id.clone();
        let batch = &self.pending;
        let result = retry_with_backoff(
            self.config.write_retries,
            self.config.backoff_base,
            || store.append(&workflow_id, batch),
        )
        .await;

        match result {
            Ok(()) => {
                debug!(workflow_id = %self.workflow_id, records = self.pending.len(), "journal batch written");
                self.pending.clear();
                if self.health.degraded.swap(false, Ordering::SeqCst) {
                    info!(workflow_id = %self.workflow_id, "journal recovered");
                }
            }
            Err(e) => {
                self.health.failed_writes.fetch_add(1, Ordering::SeqCst);
                *self.health.last_error.lock() = Some(e.to_string());
                let was_degraded = self.health.degraded.swap(true, Ordering::SeqCst);
                warn!(
                    workflow_id = %self.workflow_id,
                    backlog = self.pending.len(),
                    error = %e,
                    "journal write failed after retries"
                );
                if !was_degraded {
                    if let Some(alert) = &self.alert {
                        alert(format!(
                            "persistence degraded for workflow '{}': {e}",
                            self.workflow_id
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{EventLog, MemoryWorkflowStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use conductor_core::{AgentId, ConductorError, WorkflowEvent, WorkflowSnapshot};
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` appends, then delegates.
    struct FlakyStore {
        inner: MemoryWorkflowStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl WorkflowStore for FlakyStore {
        async fn append(&self, workflow_id: &str, records: &[LogRecord]) -> ConductorResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ConductorError::Persistence("disk unavailable".into()));
            }
            self.inner.append(workflow_id, records).await
        }
        async fn write_snapshot(&self, snapshot: &WorkflowSnapshot) -> ConductorResult<()> {
            self.inner.write_snapshot(snapshot).await
        }
        async fn latest_snapshot(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowSnapshot>> {
            self.inner.latest_snapshot(workflow_id).await
        }
        async fn read_log(&self, workflow_id: &str, after: u64) -> ConductorResult<EventLog> {
            self.inner.read_log(workflow_id, after).await
        }
        async fn list_workflows(&self) -> ConductorResult<Vec<String>> {
            self.inner.list_workflows().await
        }
        async fn snapshot_versions(&self, workflow_id: &str) -> ConductorResult<Vec<u64>> {
            self.inner.snapshot_versions(workflow_id).await
        }
    }

    fn record(seq: u64) -> LogRecord {
        LogRecord {
            workflow_id: "wf".into(),
            seq,
            event: WorkflowEvent::AgentDeregistered {
                agent_id: AgentId::new("a1"),
                at: Utc::now(),
            },
        }
    }

    fn fast_config(write_retries: u32) -> JournalConfig {
        JournalConfig {
            write_retries,
            backoff_base: Duration::from_millis(1),
            retry_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_append_and_flush() {
        let store = Arc::new(MemoryWorkflowStore::new());
        let journal = Journal::spawn("wf", store.clone(), fast_config(3), None);
        for seq in 1..=5 {
            journal.append(record(seq));
        }
        assert!(journal.flush().await);
        assert_eq!(store.log_len("wf"), 5);
        assert!(!journal.is_degraded());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryWorkflowStore::new(),
            failures: AtomicUsize::new(2),
        });
        let journal = Journal::spawn("wf", store.clone(), fast_config(3), None);
        journal.append(record(1));
        assert!(journal.flush().await);
        assert!(!journal.is_degraded());
        assert_eq!(store.inner.log_len("wf"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_degrade_and_alert_once() {
        let store = Arc::new(FlakyStore {
            inner: MemoryWorkflowStore::new(),
            failures: AtomicUsize::new(4),
        });
        let alerts = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = alerts.clone();
        let hook: AlertHook = Arc::new(move |msg: String| sink.lock().push(msg));
        let config = JournalConfig {
            retry_interval: Duration::from_secs(60),
            ..fast_config(2)
        };
        let journal = Journal::spawn("wf", store.clone(), config, Some(hook));

        journal.append(record(1));
        assert!(!journal.flush().await);
        assert!(journal.is_degraded());

        journal.append(record(2));
        assert!(!journal.flush().await);
        assert_eq!(alerts.lock().len(), 1);
        assert_eq!(journal.status().failed_writes, 2);

        // The store is healthy again: the backlog drains in order.
        assert!(journal.flush().await);
        assert!(!journal.is_degraded());
        let log = store.inner.read_log("wf", 0).await.unwrap();
        let seqs: Vec<u64> = log.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_backlog_retried_without_new_commands() {
        let store = Arc::new(FlakyStore {
            inner: MemoryWorkflowStore::new(),
            failures: AtomicUsize::new(1),
        });
        let journal = Journal::spawn("wf", store.clone(), fast_config(1), None);
        journal.append(record(1));
        assert!(!journal.flush().await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.inner.log_len("wf"), 1);
        assert!(!journal.is_degraded());
    }

    #[tokio::test]
    async fn test_retry_with_backoff_gives_up() {
        let calls = AtomicUsize::new(0);
        let result: ConductorResult<()> = retry_with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConductorError::Persistence("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
