use crate::config::ConductorConfig;
use crate::manager::CoordinationManager;
use crate::ticker::Ticker;
use conductor_channels::MessageBus;
use conductor_core::{channels, Clock, ConductorResult, Envelope, Message};
use conductor_session::{RecoveryReport, WorkflowStore};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Outcome of [`WorkflowHost::recover_all`].
#[derive(Debug, Default)]
pub struct HostRecovery {
    pub recovered: Vec<RecoveryReport>,
    /// Workflows that could not be opened, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Runs every workflow found in one store side by side.
///
/// Workflows share the bus, clock and configuration but nothing else: one
/// that fails to recover is reported and skipped while the rest proceed.
pub struct WorkflowHost {
    config: ConductorConfig,
    store: Arc<dyn WorkflowStore>,
    bus: Arc<MessageBus>,
    clock: Arc<dyn Clock>,
    managers: DashMap<String, Arc<CoordinationManager>>,
    tickers: parking_lot::Mutex<HashMap<String, Ticker>>,
    opening: tokio::sync::Mutex<()>,
}

impl WorkflowHost {
    pub fn new(
        config: ConductorConfig,
        store: Arc<dyn WorkflowStore>,
        bus: Arc<MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            clock,
            managers: DashMap::new(),
            tickers: parking_lot::Mutex::new(HashMap::new()),
            opening: tokio::sync::Mutex::new(()),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Open a workflow, recovering whatever the store holds for it, and
    /// subscribe it to agent events. Opening an open workflow returns it.
    pub async fn open(&self, workflow_id: &str) -> ConductorResult<Arc<CoordinationManager>> {
        self.open_reporting(workflow_id).await.map(|(manager, _)| manager)
    }

    /// Like [`open`](Self::open); the report is `None` when the workflow was
    /// already open.
    async fn open_reporting(
        &self,
        workflow_id: &str,
    ) -> ConductorResult<(Arc<CoordinationManager>, Option<RecoveryReport>)> {
        let _opening = self.opening.lock().await;
        if let Some(existing) = self.get(workflow_id) {
            return Ok((existing, None));
        }
        let (manager, report) = CoordinationManager::open(
            workflow_id,
            self.config.clone(),
            self.store.clone(),
            self.bus.clone(),
            self.clock.clone(),
        )
        .await?;
        let manager = Arc::new(manager);
        manager.attach();
        self.managers
            .insert(workflow_id.to_string(), manager.clone());
        info!(
            workflow_id,
            snapshot_version = ?report.snapshot_version,
            replayed = report.replayed,
            clean = report.is_clean(),
            "workflow opened"
        );
        Ok((manager, Some(report)))
    }

    /// Open every workflow in the store.
    pub async fn recover_all(&self) -> ConductorResult<HostRecovery> {
        let mut outcome = HostRecovery::default();
        for workflow_id in self.store.list_workflows().await? {
            match self.open_reporting(&workflow_id).await {
                Ok((_, Some(report))) => outcome.recovered.push(report),
                Ok((_, None)) => {}
                Err(e) => {
                    error!(workflow_id = %workflow_id, error = %e, "workflow recovery failed");
                    self.bus.publish(
                        channels::OPERATOR_ALERTS,
                        Envelope::uncorrelated(Message::OperatorAlert {
                            workflow_id: workflow_id.clone(),
                            message: format!("recovery failed: {e}"),
                        }),
                    );
                    outcome.failed.push((workflow_id, e.to_string()));
                }
            }
        }
        info!(
            recovered = outcome.recovered.len(),
            failed = outcome.failed.len(),
            "workflow recovery finished"
        );
        Ok(outcome)
    }

    /// Start background loops for every open workflow that has none.
    pub fn start(&self) {
        let mut tickers = self.tickers.lock();
        for entry in &self.managers {
            if !tickers.contains_key(entry.key()) {
                tickers.insert(entry.key().clone(), Ticker::start(entry.value().clone()));
            }
        }
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<CoordinationManager>> {
        self.managers.get(workflow_id).map(|m| m.value().clone())
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.managers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Stop every workflow's loops and persist its final state.
    pub async fn shutdown(&self) {
        let tickers: Vec<Ticker> = self.tickers.lock().drain().map(|(_, t)| t).collect();
        for ticker in tickers {
            ticker.shutdown().await;
        }
        for manager in self.managers.iter().map(|e| e.value().clone()).collect::<Vec<_>>() {
            manager.flush().await;
        }
        info!(workflows = self.managers.len(), "host stopped");
    }
}
