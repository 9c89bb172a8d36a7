//! The stats service: trackers, expiry sweeper and resource guard behind one
//! settings-refresh entry point.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::breaker::{BreakerConfig, MemoryAccounting, ResourceGuard};
use crate::error::Result;
use crate::log_stream::{Reconfigured, StreamStats};
use crate::settings::{RefreshOutcome, SettingsDelta, StatsSettings};
use crate::sweeper::{ExpirySweeper, Sweepable, SweeperHandle};
use crate::tracker::{JobTracker, OperationTracker};

/// What one [`StatsService::refresh`] changed.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub jobs: Reconfigured,
    pub operations: Reconfigured,
    pub breakers: Vec<BreakerConfig>,
    pub sweeper_restarted: bool,
}

pub struct StatsService<A> {
    settings: Mutex<StatsSettings>,
    jobs: Arc<JobTracker>,
    operations: Arc<OperationTracker>,
    guard: ResourceGuard<A>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl<A: MemoryAccounting> StatsService<A> {
    /// Build the service from `settings` and start the sweeper.
    pub fn start(settings: StatsSettings, accounting: Arc<A>, available_memory: u64) -> Result<Self> {
        let jobs = Arc::new(JobTracker::new(settings.jobs_policy()));
        let operations = Arc::new(OperationTracker::new(settings.operations_policy()));
        let guard = ResourceGuard::new(accounting, &settings, available_memory);
        let sweeper = Self::spawn_sweeper(&jobs, &operations, &settings)?;

        info!(
            enabled = settings.enabled,
            jobs = %jobs.log().kind(),
            operations = %operations.log().kind(),
            "Stats service started"
        );

        Ok(Self {
            settings: Mutex::new(settings),
            jobs,
            operations,
            guard,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    fn spawn_sweeper(
        jobs: &Arc<JobTracker>,
        operations: &Arc<OperationTracker>,
        settings: &StatsSettings,
    ) -> Result<SweeperHandle> {
        let jobs: Arc<dyn Sweepable> = jobs.clone();
        let operations: Arc<dyn Sweepable> = operations.clone();
        ExpirySweeper::spawn(vec![jobs, operations], settings.sweep_interval)
    }

    /// Fold `delta` into the effective settings and apply the result.
    ///
    /// Rejected keys keep their previous value; see [`RefreshOutcome`].
    pub fn refresh(&self, delta: &SettingsDelta) -> Result<(RefreshOutcome, RefreshReport)> {
        let mut current = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = current.apply(delta);
        if !outcome.rejected.is_empty() {
            warn!(rejected = outcome.rejected.len(), "Settings refresh partially applied");
        }
        let report = self.commit(&mut current, &outcome.settings)?;
        Ok((outcome, report))
    }

    /// Push `next` into the trackers, the guard and the sweeper.
    ///
    /// The new sweep interval only becomes effective once its thread is
    /// running; on a spawn failure the old thread and interval stay.
    fn commit(&self, current: &mut StatsSettings, next: &StatsSettings) -> Result<RefreshReport> {
        let jobs = self.jobs.reconfigure(next.jobs_policy());
        let operations = self.operations.reconfigure(next.operations_policy());
        let breakers = self.guard.apply(next);

        let sweeper_restarted = next.sweep_interval != current.sweep_interval;
        *current = StatsSettings {
            sweep_interval: current.sweep_interval,
            ..next.clone()
        };

        if sweeper_restarted {
            let replacement = Self::spawn_sweeper(&self.jobs, &self.operations, next)?;
            current.sweep_interval = next.sweep_interval;
            let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = sweeper.replace(replacement) {
                old.shutdown();
            }
        }

        Ok(RefreshReport {
            jobs,
            operations,
            breakers,
            sweeper_restarted,
        })
    }

    /// Copy of the effective settings.
    #[must_use]
    pub fn settings(&self) -> StatsSettings {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).enabled
    }

    #[must_use]
    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    #[must_use]
    pub fn operations(&self) -> &OperationTracker {
        &self.operations
    }

    #[must_use]
    pub fn guard(&self) -> &ResourceGuard<A> {
        &self.guard
    }

    /// Counters of both streams.
    #[must_use]
    pub fn stream_stats(&self) -> [StreamStats; 2] {
        [self.jobs.log().stats(), self.operations.log().stats()]
    }

    /// Stop the sweeper. The trackers keep working without expiry.
    pub fn shutdown(&self) {
        let handle = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.shutdown();
            info!("Stats service stopped");
        }
    }
}

impl<A> std::fmt::Debug for StatsService<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsService")
            .field("jobs", &self.jobs)
            .field("operations", &self.operations)
            .finish()
    }
}
