use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, LogRecord, WorkflowSnapshot};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

/// A log line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamagedRecord {
    /// 1-based line number in the log.
    pub line: usize,
    pub error: String,
}

/// Records read back from a workflow's log.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    pub records: Vec<LogRecord>,
    pub damaged: Vec<DamagedRecord>,
}

/// Durable home of workflow snapshots and event logs.
///
/// Snapshots are append-only: writing a version that already exists is an
/// error, never an overwrite.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn append(&self, workflow_id: &str, records: &[LogRecord]) -> ConductorResult<()>;
    async fn write_snapshot(&self, snapshot: &WorkflowSnapshot) -> ConductorResult<()>;
    /// The newest snapshot that can be read; damaged newer ones are skipped.
    async fn latest_snapshot(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowSnapshot>>;
    /// Every log record with `seq > after`, in log order.
    async fn read_log(&self, workflow_id: &str, after: u64) -> ConductorResult<EventLog>;
    async fn list_workflows(&self) -> ConductorResult<Vec<String>>;
    async fn snapshot_versions(&self, workflow_id: &str) -> ConductorResult<Vec<u64>>;
}

/// Workflow ids become directory names, so keep them to a safe alphabet.
pub fn validate_workflow_id(workflow_id: &str) -> ConductorResult<()> {
    let ok = !workflow_id.is_empty()
        && workflow_id.len() <= 128
        && !workflow_id.starts_with('.')
        && workflow_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ConductorError::Config(format!(
            "invalid workflow id '{workflow_id}'"
        )))
    }
}

/// File-based store: `<dir>/<workflow>/snapshots/<version>.json` plus an
/// `events.jsonl` log per workflow.
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    pub async fn new(dir: PathBuf) -> ConductorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn workflow_dir(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(workflow_id)
    }

    fn snapshot_dir(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("snapshots")
    }

    fn log_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("events.jsonl")
    }

    fn snapshot_path(&self, workflow_id: &str, version: u64) -> PathBuf {
        self.snapshot_dir(workflow_id)
            .join(format!("{version:020}.json"))
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn append(&self, workflow_id: &str, records: &[LogRecord]) -> ConductorResult<()> {
        validate_workflow_id(workflow_id)?;
        if records.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(self.workflow_dir(workflow_id)).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.log_path(workflow_id))
            .await?;

        // A write that failed partway leaves a fragment with no newline.
        // Close it off so the next record starts on its own line.
        let mut buf = String::new();
        if file.metadata().await?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                buf.push('\n');
            }
        }
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &WorkflowSnapshot) -> ConductorResult<()> {
        validate_workflow_id(&snapshot.workflow_id)?;
        let dir = self.snapshot_dir(&snapshot.workflow_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.snapshot_path(&snapshot.workflow_id, snapshot.version);
        if tokio::fs::try_exists(&path).await? {
            return Err(ConductorError::Persistence(format!(
                "snapshot v{} of '{}' already exists",
                snapshot.version, snapshot.workflow_id
            )));
        }

        // Write aside then rename, so a crash never leaves a half-written
        // file under the final name.
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn latest_snapshot(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowSnapshot>> {
        validate_workflow_id(workflow_id)?;
        let mut versions = self.snapshot_versions(workflow_id).await?;
        versions.reverse();
        for version in versions {
            let path = self.snapshot_path(workflow_id, version);
            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<WorkflowSnapshot>(&bytes)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    warn!(
                        workflow_id = %workflow_id,
                        version,
                        error = %e,
                        "Skipping unreadable snapshot"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn read_log(&self, workflow_id: &str, after: u64) -> ConductorResult<EventLog> {
        validate_workflow_id(workflow_id)?;
        let path = self.log_path(workflow_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(EventLog::default());
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let mut log = EventLog::default();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) if record.seq > after => log.records.push(record),
                Ok(_) => {}
                Err(e) => log.damaged.push(DamagedRecord {
                    line: idx + 1,
                    error: e.to_string(),
                }),
            }
        }
        Ok(log)
    }

    async fn list_workflows(&self) -> ConductorResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if validate_workflow_id(name).is_ok() {
                        ids.push(name.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn snapshot_versions(&self, workflow_id: &str) -> ConductorResult<Vec<u64>> {
        validate_workflow_id(workflow_id)?;
        let dir = self.snapshot_dir(workflow_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(version) = stem.parse::<u64>() {
                        versions.push(version);
                    }
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

#[derive(Default)]
struct MemoryWorkflow {
    snapshots: BTreeMap<u64, WorkflowSnapshot>,
    log: Vec<LogRecord>,
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: Mutex<HashMap<String, MemoryWorkflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total log records held for `workflow_id`.
    pub fn log_len(&self, workflow_id: &str) -> usize {
        self.workflows
            .lock()
            .get(workflow_id)
            .map(|w| w.log.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn append(&self, workflow_id: &str, records: &[LogRecord]) -> ConductorResult<()> {
        let mut workflows = self.workflows.lock();
        workflows
            .entry(workflow_id.to_string())
            .or_default()
            .log
            .extend_from_slice(records);
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &WorkflowSnapshot) -> ConductorResult<()> {
        let mut workflows = self.workflows.lock();
        let workflow = workflows.entry(snapshot.workflow_id.clone()).or_default();
        if workflow.snapshots.contains_key(&snapshot.version) {
            return Err(ConductorError::Persistence(format!(
                "snapshot v{} of '{}' already exists",
                snapshot.version, snapshot.workflow_id
            )));
        }
        workflow
            .snapshots
            .insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowSnapshot>> {
        Ok(self
            .workflows
            .lock()
            .get(workflow_id)
            .and_then(|w| w.snapshots.values().next_back().cloned()))
    }

    async fn read_log(&self, workflow_id: &str, after: u64) -> ConductorResult<EventLog> {
        let records = self
            .workflows
            .lock()
            .get(workflow_id)
            .map(|w| w.log.iter().filter(|r| r.seq > after).cloned().collect())
            .unwrap_or_default();
        Ok(EventLog {
            records,
            damaged: Vec::new(),
        })
    }

    async fn list_workflows(&self) -> ConductorResult<Vec<String>> {
        let mut ids: Vec<String> = self.workflows.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn snapshot_versions(&self, workflow_id: &str) -> ConductorResult<Vec<u64>> {
        Ok(self
            .workflows
            .lock()
            .get(workflow_id)
            .map(|w| w.snapshots.keys().copied().collect())
            .unwrap_or_default())
    }
}
