use crate::manager::{CoordinationManager, SweepReport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background loops driving one workflow: scheduling ticks, liveness sweeps
/// and periodic snapshots.
pub struct Ticker {
    manager: Arc<CoordinationManager>,
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn the loops. Must be called from within a Tokio runtime.
    pub fn start(manager: Arc<CoordinationManager>) -> Self {
        let cancel = CancellationToken::new();
        let config = manager.config().clone();
        let tick = Duration::from_millis(config.coordination.tick_interval_ms);
        let sweep = Duration::from_secs(config.liveness.sweep_interval_secs);
        let snapshot = Duration::from_secs(config.persistence.snapshot_interval_secs);

        let loops = vec![
            spawn_every(tick, cancel.clone(), manager.clone(), |m| async move {
                let assigned = m.schedule_tick();
                if assigned > 0 {
                    debug!(workflow_id = %m.workflow_id(), assigned, "scheduling tick");
                }
            }),
            spawn_every(sweep, cancel.clone(), manager.clone(), |m| async move {
                let report = m.sweep();
                if report != SweepReport::default() {
                    info!(
                        workflow_id = %m.workflow_id(),
                        stale = report.stale.len(),
                        offline = report.offline.len(),
                        reassigned = report.reassigned.len(),
                        timed_out = report.timed_out.len(),
                        expired = report.expired.len(),
                        "liveness sweep"
                    );
                }
            }),
            spawn_every(snapshot, cancel.clone(), manager.clone(), |m| async move {
                if let Err(e) = m.snapshot().await {
                    warn!(workflow_id = %m.workflow_id(), error = %e, "periodic snapshot failed");
                }
            }),
        ];

        info!(workflow_id = %manager.workflow_id(), "coordination loops started");
        Self {
            manager,
            cancel,
            loops,
        }
    }

    pub fn manager(&self) -> &Arc<CoordinationManager> {
        &self.manager
    }

    /// Stop the loops, drain the journal and write a final snapshot.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.loops {
            if let Err(e) = handle.await {
                warn!(workflow_id = %self.manager.workflow_id(), error = %e, "coordination loop panicked");
            }
        }
        if !self.manager.flush().await {
            warn!(workflow_id = %self.manager.workflow_id(), "journal not fully written at shutdown");
        }
        if let Err(e) = self.manager.snapshot().await {
            warn!(workflow_id = %self.manager.workflow_id(), error = %e, "final snapshot failed");
        }
        info!(workflow_id = %self.manager.workflow_id(), "coordination loops stopped");
    }
}

fn spawn_every<F, Fut>(
    period: Duration,
    cancel: CancellationToken,
    manager: Arc<CoordinationManager>,
    mut step: F,
) -> JoinHandle<()>
where
    F: FnMut(Arc<CoordinationManager>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => step(manager.clone()).await,
            }
        }
    })
}
