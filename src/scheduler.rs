//! Periodic dispatcher for sync and prune passes.
//!
//! Two timers drive the loop. The check timer reaps stale runs and
//! dispatches scopes that are due for sync. The prune timer deletes old
//! failed runs, dispatches scopes due for pruning, and sweeps orphaned
//! local copies.
//!
//! A scope has at most one sync and one prune in flight in this process.
//! The prune slot belongs to the orchestrator, so the prune that closes a
//! sync pass and a triggered prune exclude each other. Passes for
//! different scopes run concurrently on a semaphore-bounded pool.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use filesync_core::models::{PruneReport, Run, RunStatus, RunType, SyncScope};
use filesync_core::{Result, SyncError};

use crate::config::SchedulerConfig;
use crate::sync::{in_flight, InFlight, InFlightSet, SyncOrchestrator, SyncReport};

pub const STALE_RUN_REASON: &str = "abandoned: exceeded stale run timeout";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub dispatched: usize,
}

pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    config: SchedulerConfig,
    syncing: InFlightSet,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: SchedulerConfig) -> Self {
        let workers = config.max_scopes_per_tick.max(1);
        Self {
            orchestrator,
            config,
            syncing: InFlightSet::default(),
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.stale_run_timeout_secs as i64)
    }

    pub fn is_syncing(&self, scope_id: &str) -> bool {
        in_flight(&self.syncing, scope_id)
    }

    pub fn is_pruning(&self, scope_id: &str) -> bool {
        self.orchestrator.is_pruning(scope_id)
    }

    /// Fail `IN_PROGRESS` runs older than the stale timeout.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let scopes = self.orchestrator.scopes();
        let reaped = scopes
            .reap_stale_runs(self.stale_cutoff(now), STALE_RUN_REASON)
            .await?;
        for run in &reaped {
            warn!(run = %run.id, scope = %run.scope_id, started_at = %run.started_at, "reaped stale run");
            scopes
                .record_attempt_status(&run.scope_id, RunStatus::Failed)
                .await?;
        }
        Ok(reaped.len())
    }

    async fn live_scope_ids(&self, now: DateTime<Utc>, kind: Option<RunType>) -> Result<HashSet<String>> {
        Ok(self
            .orchestrator
            .scopes()
            .active_runs(self.stale_cutoff(now))
            .await?
            .into_iter()
            .filter(|run| kind.map_or(run.run_type != RunType::Prune, |k| run.run_type == k))
            .map(|run| run.scope_id)
            .collect())
    }

    /// Scopes due for a sync pass, least recently synced first.
    pub async fn due_for_sync(&self, now: DateTime<Utc>) -> Result<Vec<SyncScope>> {
        let live = self.live_scope_ids(now, None).await?;
        let refresh = Duration::seconds(self.config.refresh_interval_secs as i64);
        let mut due: Vec<SyncScope> = self
            .orchestrator
            .scopes()
            .list_scopes()
            .await?
            .into_iter()
            .filter(|s| !live.contains(&s.id) && s.is_due_for_sync(now, refresh))
            .collect();
        due.sort_by(|a, b| {
            a.last_successful_at
                .cmp(&b.last_successful_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        due.truncate(self.config.max_scopes_per_tick);
        Ok(due)
    }

    pub async fn due_for_prune(&self, now: DateTime<Utc>) -> Result<Vec<SyncScope>> {
        let live = self.live_scope_ids(now, Some(RunType::Prune)).await?;
        let interval = Duration::seconds(self.config.prune_interval_secs as i64);
        Ok(self
            .orchestrator
            .scopes()
            .list_scopes()
            .await?
            .into_iter()
            .filter(|s| !live.contains(&s.id) && s.is_due_for_prune(now, interval))
            .collect())
    }

    /// Create a run for `scope_id` and execute it in the background.
    ///
    /// Returns `None` when a sync for the scope is already in flight.
    pub async fn trigger_sync(
        &self,
        scope_id: &str,
    ) -> Result<Option<(Run, JoinHandle<Result<SyncReport>>)>> {
        let Some(claim) = InFlight::claim(&self.syncing, scope_id) else {
            debug!(scope = scope_id, "sync already in flight");
            return Ok(None);
        };

        let (scope, run) = self.orchestrator.start_run(scope_id).await?;
        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        let pending = run.clone();
        let handle = tokio::spawn(async move {
            let _claim = claim;
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| SyncError::store("scheduler pool closed"))?;
            orchestrator.execute(&scope, pending).await
        });
        Ok(Some((run, handle)))
    }

    /// Run a prune in the background. `None` when one is already in flight.
    pub fn trigger_prune(&self, scope_id: &str) -> Option<JoinHandle<Result<PruneReport>>> {
        let Some(claim) = self.orchestrator.claim_prune(scope_id) else {
            debug!(scope = scope_id, "prune already in flight");
            return None;
        };
        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        Some(tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| SyncError::store("scheduler pool closed"))?;
            orchestrator.prune_claimed(&claim).await
        }))
    }

    /// Reap stale runs and dispatch every scope due for sync.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = Utc::now();
        let mut report = TickReport {
            reaped: self.reap_stale(now).await?,
            ..TickReport::default()
        };
        for scope in self.due_for_sync(now).await? {
            match self.trigger_sync(&scope.id).await {
                Ok(Some((run, _))) => {
                    debug!(scope = %scope.id, run = %run.id, "dispatched sync");
                    report.dispatched += 1;
                }
                Ok(None) => {}
                Err(e) => error!(scope = %scope.id, error = %e, "could not start sync"),
            }
        }
        Ok(report)
    }

    /// Clean up old failed runs and dispatch every scope due for prune.
    pub async fn prune_tick(&self) -> Result<usize> {
        let now = Utc::now();
        let retention = Duration::seconds(self.config.failed_run_retention_secs as i64);
        let deleted = self
            .orchestrator
            .scopes()
            .delete_failed_runs_before(now - retention)
            .await?;
        if deleted > 0 {
            info!(deleted, "deleted old failed runs");
        }

        let mut dispatched = 0;
        for scope in self.due_for_prune(now).await? {
            if self.trigger_prune(&scope.id).is_some() {
                dispatched += 1;
            }
        }

        if let Some(copies) = self.orchestrator.local_copies() {
            if let Err(e) = copies
                .cleanup_orphans(self.orchestrator.documents().as_ref())
                .await
            {
                warn!(error = %e, "orphaned copy cleanup failed");
            }
        }
        Ok(dispatched)
    }

    /// Run both timers until `shutdown` resolves.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut check = tokio::time::interval(std::time::Duration::from_secs(
            self.config.check_interval_secs,
        ));
        let mut prune = tokio::time::interval(std::time::Duration::from_secs(
            self.config.prune_interval_secs,
        ));
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            check_secs = self.config.check_interval_secs,
            prune_secs = self.config.prune_interval_secs,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = check.tick() => match self.tick().await {
                    Ok(report) if report.dispatched > 0 || report.reaped > 0 => {
                        info!(dispatched = report.dispatched, reaped = report.reaped, "scheduler tick");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "scheduler tick failed"),
                },
                _ = prune.tick() => {
                    if let Err(e) = self.prune_tick().await {
                        error!(error = %e, "prune tick failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }
}
