//! Trigger gateway
//!
//! Operator-initiated "run now" requests go through the identical admission
//! gate as the scheduler, so a manual trigger can neither double-run an
//! agent nor violate its budgets. Admission answers immediately; execution
//! proceeds asynchronously and the caller confirms the outcome through a
//! bounded poll loop instead of blocking open-endedly.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use runledger::{AdmissionRejection, AdmitOutcome, ExecutionRecord, ExecutionStatus, now_ms};

use crate::config::{SchedulerConfig, TriggerConfig};
use crate::executor::RunExecutor;
use crate::provider::ProviderRegistry;
use crate::scheduler::compute_next_run;
use crate::state::{StateError, StateManager};

/// Source tag recorded on operator-initiated executions
pub const SOURCE_MANUAL: &str = "manual";

/// Immediate answer to a trigger request
#[derive(Debug, Clone)]
pub enum TriggerResponse {
    /// Record created; execution is running asynchronously
    Accepted { execution_id: String },
    /// Typed admission rejection; no record was created
    Rejected(AdmissionRejection),
}

/// Result of the bounded outcome poll
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(ExecutionRecord),
    Failed(ExecutionRecord),
    /// Still running after the poll budget; consult the ledger later
    StillRunning,
}

/// The trigger gateway over one StateManager
#[derive(Clone)]
pub struct TriggerGateway {
    state: StateManager,
    executor: RunExecutor,
    providers: ProviderRegistry,
    scheduler_config: SchedulerConfig,
    config: TriggerConfig,
}

impl TriggerGateway {
    /// Create a new gateway
    pub fn new(
        state: StateManager,
        executor: RunExecutor,
        providers: ProviderRegistry,
        scheduler_config: SchedulerConfig,
        config: TriggerConfig,
    ) -> Self {
        Self {
            state,
            executor,
            providers,
            scheduler_config,
            config,
        }
    }

    /// Request an immediate run of the named agent
    ///
    /// A manual trigger does not advance the agent's automatic clock unless
    /// `reschedule-on-manual` is configured; operator actions stay isolated
    /// from the automatic cadence by default.
    pub async fn trigger(&self, name: &str) -> Result<TriggerResponse, StateError> {
        debug!(%name, "trigger: called");
        let def = self.state.get_agent_required(name).await?;
        let now = now_ms();

        match self.state.admit_run(name, SOURCE_MANUAL, now).await? {
            AdmitOutcome::Rejected(reason) => {
                info!(agent = %name, %reason, "Manual trigger rejected");
                Ok(TriggerResponse::Rejected(reason))
            }
            AdmitOutcome::Admitted(record) => {
                info!(agent = %name, execution_id = %record.id, "Manual trigger accepted");

                if self.scheduler_config.reschedule_on_manual && !def.schedule.is_manual() {
                    let next = compute_next_run(&def.schedule, now);
                    if let Err(e) = self.state.advance_schedule(name, now, next).await {
                        warn!(agent = %name, error = %e, "trigger: failed to reschedule after manual run");
                    }
                }

                let execution_id = record.id.clone();
                self.executor.spawn_run(record, def, &self.providers);
                Ok(TriggerResponse::Accepted { execution_id })
            }
        }
    }

    /// Poll the execution record until terminal, bounded by the configured
    /// attempt budget
    pub async fn await_outcome(&self, execution_id: &str) -> Result<TriggerOutcome, StateError> {
        debug!(%execution_id, "await_outcome: called");
        for attempt in 0..self.config.max_polls {
            if attempt > 0 {
                sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
            }

            let record = self
                .state
                .get_record(execution_id)
                .await?
                .ok_or_else(|| StateError::NotFound(format!("Execution {}", execution_id)))?;

            match record.status {
                ExecutionStatus::Completed => return Ok(TriggerOutcome::Completed(record)),
                ExecutionStatus::Failed => return Ok(TriggerOutcome::Failed(record)),
                ExecutionStatus::Running => {
                    debug!(%execution_id, attempt, "await_outcome: still running");
                }
            }
        }

        debug!(%execution_id, "await_outcome: poll budget exhausted");
        Ok(TriggerOutcome::StillRunning)
    }
}
