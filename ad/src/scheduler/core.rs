//! Scheduler - the periodic tick that admits due agents
//!
//! Each tick computes the due set from the stored definitions and pushes
//! every due agent through the shared admission gate. Rejections are skipped
//! until the next tick; the scheduler is idempotent and self-correcting and
//! never queues missed ticks.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use runledger::{AdmitOutcome, AgentDef, Schedule, now_ms};

use super::cron;
use crate::config::SchedulerConfig;
use crate::executor::RunExecutor;
use crate::provider::ProviderRegistry;
use crate::state::StateManager;

/// Source tag recorded on scheduler-initiated executions
pub const SOURCE_SCHEDULER: &str = "scheduler";

/// The scheduler over one StateManager
pub struct Scheduler {
    state: StateManager,
    executor: RunExecutor,
    providers: ProviderRegistry,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(state: StateManager, executor: RunExecutor, providers: ProviderRegistry, config: SchedulerConfig) -> Self {
        debug!(tick_secs = config.tick_secs, "Scheduler::new: called");
        Self {
            state,
            executor,
            providers,
            config,
        }
    }

    /// Run the tick loop until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.config.tick_secs, "Scheduler started");

        if let Err(e) = self.seed_next_runs(now_ms()).await {
            warn!(error = %e, "Failed to seed next-run times");
        }

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let admitted = self.tick(now_ms()).await;
                    if admitted > 0 {
                        debug!(admitted, "Scheduler tick admitted runs");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One evaluation pass over all agents; returns the number admitted
    ///
    /// One agent's failure never halts the pass.
    pub async fn tick(&self, now: i64) -> usize {
        debug!(now, "tick: called");
        let agents = match self.state.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "tick: failed to list agents");
                return 0;
            }
        };

        let mut admitted = 0;
        for def in agents {
            if !is_due(&def, now) {
                continue;
            }

            match self.state.admit_run(&def.name, SOURCE_SCHEDULER, now).await {
                Ok(AdmitOutcome::Admitted(record)) => {
                    admitted += 1;
                    info!(agent = %def.name, execution_id = %record.id, "Scheduler admitted run");

                    // Advance the clock first so a crash mid-spawn cannot
                    // re-admit the same tick after restart
                    let next = compute_next_run(&def.schedule, now);
                    if let Err(e) = self.state.advance_schedule(&def.name, now, next).await {
                        warn!(agent = %def.name, error = %e, "tick: failed to advance schedule");
                    }

                    self.executor.spawn_run(record, def, &self.providers);
                }
                Ok(AdmitOutcome::Rejected(reason)) => {
                    // Silently skipped until the next tick
                    debug!(agent = %def.name, %reason, "tick: admission rejected");
                }
                Err(e) => {
                    warn!(agent = %def.name, error = %e, "tick: admission errored");
                }
            }
        }
        admitted
    }

    /// Compute next_run_at for automatic agents that do not have one yet
    ///
    /// Runs on startup and covers agents created before the daemon, agents
    /// whose schedule was edited, and databases migrated from older builds.
    pub async fn seed_next_runs(&self, now: i64) -> Result<(), crate::state::StateError> {
        debug!("seed_next_runs: called");
        let agents = self.state.list_agents().await?;
        for def in agents {
            if def.schedule.is_manual() || !def.enabled || def.next_run_at.is_some() {
                continue;
            }
            let next = seed_next_run(&def, now);
            debug!(agent = %def.name, ?next, "seed_next_runs: seeding");
            self.state.set_next_run(&def.name, next).await?;
        }
        Ok(())
    }
}

/// Whether the scheduler should attempt admission for this agent now
fn is_due(def: &AgentDef, now: i64) -> bool {
    if !def.enabled || def.paused || def.schedule.is_manual() {
        return false;
    }
    match def.next_run_at {
        Some(due) => due <= now,
        None => false,
    }
}

/// Next automatic run after a run that starts at `now`
///
/// Interval schedules anchor on the run just started; cron schedules take
/// the next occurrence strictly after now.
pub fn compute_next_run(schedule: &Schedule, now: i64) -> Option<i64> {
    match schedule {
        Schedule::Manual => None,
        Schedule::Interval { hours } => Some(now + (hours * 3_600_000.0) as i64),
        Schedule::Cron { expression } => {
            let after = chrono::DateTime::from_timestamp_millis(now)?;
            cron::next_occurrence(expression, after).map(|t| t.timestamp_millis())
        }
    }
}

/// First next_run_at for an agent that has none
///
/// Interval schedules anchor on the last run when one exists (a stale
/// anchor makes the agent due immediately), otherwise on now.
fn seed_next_run(def: &AgentDef, now: i64) -> Option<i64> {
    match &def.schedule {
        Schedule::Manual => None,
        Schedule::Interval { .. } => compute_next_run(&def.schedule, def.last_run_at.unwrap_or(now)),
        Schedule::Cron { .. } => compute_next_run(&def.schedule, now),
    }
}
