//! StateManager - actor that owns the execution ledger
//!
//! Processes commands via channels for thread-safe access to persistent
//! state. Commands are handled serially by a single owner, so the admission
//! check-and-create is atomic with respect to every other in-process caller;
//! the ledger's own transaction covers external processes sharing the
//! database file.

use std::path::Path;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use runledger::{
    AdmitOutcome, AgentDef, AgentRollup, AgentStatusRow, BudgetWindow, CostReportRow, DeleteOutcome, ExecutionRecord,
    ExecutionStatus, Ledger, RunOutcome,
};

use super::messages::{StateCommand, StateError, StateResponse};

/// Event broadcast when ledger state changes that observers should react to
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A run was admitted and its record created
    ExecutionStarted { id: String, agent: String },
    /// A running record reached a terminal status
    ExecutionFinalized { id: String, agent: String, status: ExecutionStatus },
}

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    /// Broadcast sender for state change notifications
    event_tx: broadcast::Sender<StateEvent>,
}

impl StateManager {
    /// Spawn a new StateManager actor over the ledger at `path`
    pub fn spawn(path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(path = %path.as_ref().display(), "spawn: called");
        let ledger = Ledger::open(path.as_ref())?;
        Ok(Self::spawn_with(ledger))
    }

    /// Spawn over an already-open ledger (tests use the in-memory form)
    pub fn spawn_with(ledger: Ledger) -> Self {
        let (tx, rx) = mpsc::channel(256);

        // Broadcast channel for state change notifications
        let (event_tx, _) = broadcast::channel(64);

        tokio::spawn(actor_loop(ledger, rx));

        info!("StateManager spawned");

        Self { tx, event_tx }
    }

    /// Subscribe to state change events
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    // === Agent definition operations ===

    /// Create a new agent definition
    pub async fn create_agent(&self, def: AgentDef) -> StateResponse<()> {
        debug!(agent = %def.name, "create_agent: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::CreateAgent { def, reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Get an agent definition by name
    pub async fn get_agent(&self, name: &str) -> StateResponse<Option<AgentDef>> {
        debug!(%name, "get_agent: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::GetAgent {
                name: name.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Get an agent definition, erroring if it does not exist
    pub async fn get_agent_required(&self, name: &str) -> Result<AgentDef, StateError> {
        debug!(%name, "get_agent_required: called");
        self.get_agent(name)
            .await?
            .ok_or_else(|| StateError::NotFound(name.to_string()))
    }

    /// Overwrite an agent definition
    pub async fn update_agent(&self, def: AgentDef) -> StateResponse<()> {
        debug!(agent = %def.name, "update_agent: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::UpdateAgent { def, reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Delete an agent; restricted while execution records reference it
    pub async fn delete_agent(&self, name: &str) -> StateResponse<DeleteOutcome> {
        debug!(%name, "delete_agent: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::DeleteAgent {
                name: name.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// List all agent definitions
    pub async fn list_agents(&self) -> StateResponse<Vec<AgentDef>> {
        debug!("list_agents: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::ListAgents { reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Flip the enabled flag
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> StateResponse<()> {
        debug!(%name, enabled, "set_enabled: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::SetEnabled {
                name: name.to_string(),
                enabled,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Flip the paused flag
    pub async fn set_paused(&self, name: &str, paused: bool) -> StateResponse<()> {
        debug!(%name, paused, "set_paused: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::SetPaused {
                name: name.to_string(),
                paused,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Advance the automatic-run clock after a scheduler-initiated run
    pub async fn advance_schedule(&self, name: &str, last_run_at: i64, next_run_at: Option<i64>) -> StateResponse<()> {
        debug!(%name, last_run_at, ?next_run_at, "advance_schedule: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::AdvanceSchedule {
                name: name.to_string(),
                last_run_at,
                next_run_at,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Seed or clear next_run_at without touching last_run_at
    pub async fn set_next_run(&self, name: &str, next_run_at: Option<i64>) -> StateResponse<()> {
        debug!(%name, ?next_run_at, "set_next_run: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::SetNextRun {
                name: name.to_string(),
                next_run_at,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Admission and finalization ===

    /// The admission gate: check enabled, single-flight, and budget, then
    /// create the running record - one atomic operation
    pub async fn admit_run(&self, name: &str, source: &str, now: i64) -> StateResponse<AdmitOutcome> {
        debug!(%name, %source, "admit_run: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::AdmitRun {
                name: name.to_string(),
                source: source.to_string(),
                now,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        let outcome = reply_rx.await.map_err(|_| StateError::ChannelError)?;

        if let Ok(AdmitOutcome::Admitted(record)) = &outcome {
            let _ = self.event_tx.send(StateEvent::ExecutionStarted {
                id: record.id.clone(),
                agent: record.agent.clone(),
            });
        }
        outcome
    }

    /// Apply a terminal outcome to a running record
    ///
    /// Returns false when the record is already terminal; finalized records
    /// are never overwritten.
    pub async fn finalize_run(
        &self,
        id: &str,
        agent: &str,
        outcome: RunOutcome,
        finished_at: i64,
    ) -> StateResponse<bool> {
        debug!(%id, status = %outcome.status, "finalize_run: called");
        let status = outcome.status;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::FinalizeRun {
                id: id.to_string(),
                outcome,
                finished_at,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        let applied = reply_rx.await.map_err(|_| StateError::ChannelError)?;

        if let Ok(true) = &applied {
            let _ = self.event_tx.send(StateEvent::ExecutionFinalized {
                id: id.to_string(),
                agent: agent.to_string(),
                status,
            });
        }
        applied
    }

    // === Execution record queries ===

    /// Get an execution record by id
    pub async fn get_record(&self, id: &str) -> StateResponse<Option<ExecutionRecord>> {
        debug!(%id, "get_record: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::GetRecord {
                id: id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Most recent record for an agent
    pub async fn latest_record(&self, agent: &str) -> StateResponse<Option<ExecutionRecord>> {
        debug!(%agent, "latest_record: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::LatestRecord {
                agent: agent.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// The agent's running record, if any
    pub async fn running_record(&self, agent: &str) -> StateResponse<Option<ExecutionRecord>> {
        debug!(%agent, "running_record: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::RunningRecord {
                agent: agent.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Page through an agent's records with the total count
    pub async fn list_records(
        &self,
        agent: &str,
        limit: u32,
        offset: u32,
        status: Option<ExecutionStatus>,
    ) -> StateResponse<(Vec<ExecutionRecord>, u64)> {
        debug!(%agent, limit, offset, ?status, "list_records: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::ListRecords {
                agent: agent.to_string(),
                limit,
                offset,
                status,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Aggregates ===

    /// Current budget window for an agent
    pub async fn budget_window(&self, name: &str, now: i64) -> StateResponse<Option<BudgetWindow>> {
        debug!(%name, "budget_window: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::GetBudgetWindow {
                name: name.to_string(),
                now,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Latest record per agent, one aggregate query
    pub async fn status_snapshot(&self) -> StateResponse<Vec<AgentStatusRow>> {
        debug!("status_snapshot: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::StatusSnapshot { reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Per-agent counters since the given timestamp
    pub async fn rollups_since(&self, since: i64) -> StateResponse<Vec<AgentRollup>> {
        debug!(since, "rollups_since: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::RollupsSince { since, reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Cost/tokens/execution-count grouped by agent
    pub async fn cost_report(&self, since: Option<i64>) -> StateResponse<Vec<CostReportRow>> {
        debug!(?since, "cost_report: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::CostReport { since, reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Fail records left `running` by a previous process
    pub async fn sweep_orphans(&self, message: &str, now: i64) -> StateResponse<usize> {
        debug!("sweep_orphans: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::SweepOrphans {
                message: message.to_string(),
                now,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Shutdown the StateManager
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

fn store_err(e: eyre::Report) -> StateError {
    StateError::StoreError(e.to_string())
}

/// The actor loop that owns the Ledger and processes commands
async fn actor_loop(mut ledger: Ledger, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateAgent { def, reply } => {
                debug!(agent = %def.name, "actor_loop: CreateAgent command");
                let _ = reply.send(ledger.create_agent(&def).map_err(store_err));
            }

            StateCommand::GetAgent { name, reply } => {
                debug!(%name, "actor_loop: GetAgent command");
                let _ = reply.send(ledger.get_agent(&name).map_err(store_err));
            }

            StateCommand::UpdateAgent { def, reply } => {
                debug!(agent = %def.name, "actor_loop: UpdateAgent command");
                let result = match ledger.update_agent(&def) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(StateError::NotFound(def.name.clone())),
                    Err(e) => Err(store_err(e)),
                };
                let _ = reply.send(result);
            }

            StateCommand::DeleteAgent { name, reply } => {
                debug!(%name, "actor_loop: DeleteAgent command");
                let _ = reply.send(ledger.delete_agent(&name).map_err(store_err));
            }

            StateCommand::ListAgents { reply } => {
                debug!("actor_loop: ListAgents command");
                let _ = reply.send(ledger.list_agents().map_err(store_err));
            }

            StateCommand::SetEnabled { name, enabled, reply } => {
                debug!(%name, enabled, "actor_loop: SetEnabled command");
                let result = match ledger.set_enabled(&name, enabled, runledger::now_ms()) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(StateError::NotFound(name.clone())),
                    Err(e) => Err(store_err(e)),
                };
                let _ = reply.send(result);
            }

            StateCommand::SetPaused { name, paused, reply } => {
                debug!(%name, paused, "actor_loop: SetPaused command");
                let result = match ledger.set_paused(&name, paused, runledger::now_ms()) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(StateError::NotFound(name.clone())),
                    Err(e) => Err(store_err(e)),
                };
                let _ = reply.send(result);
            }

            StateCommand::AdvanceSchedule {
                name,
                last_run_at,
                next_run_at,
                reply,
            } => {
                debug!(%name, "actor_loop: AdvanceSchedule command");
                let _ = reply.send(
                    ledger
                        .advance_schedule(&name, last_run_at, next_run_at)
                        .map_err(store_err),
                );
            }

            StateCommand::SetNextRun { name, next_run_at, reply } => {
                debug!(%name, "actor_loop: SetNextRun command");
                let _ = reply.send(
                    ledger
                        .set_next_run(&name, next_run_at, runledger::now_ms())
                        .map_err(store_err),
                );
            }

            StateCommand::AdmitRun { name, source, now, reply } => {
                debug!(%name, %source, "actor_loop: AdmitRun command");
                let _ = reply.send(ledger.admit_run(&name, &source, now).map_err(store_err));
            }

            StateCommand::FinalizeRun {
                id,
                outcome,
                finished_at,
                reply,
            } => {
                debug!(%id, "actor_loop: FinalizeRun command");
                let _ = reply.send(ledger.finalize_run(&id, &outcome, finished_at).map_err(store_err));
            }

            StateCommand::GetRecord { id, reply } => {
                debug!(%id, "actor_loop: GetRecord command");
                let _ = reply.send(ledger.get_record(&id).map_err(store_err));
            }

            StateCommand::LatestRecord { agent, reply } => {
                debug!(%agent, "actor_loop: LatestRecord command");
                let _ = reply.send(ledger.latest_record(&agent).map_err(store_err));
            }

            StateCommand::RunningRecord { agent, reply } => {
                debug!(%agent, "actor_loop: RunningRecord command");
                let _ = reply.send(ledger.running_record(&agent).map_err(store_err));
            }

            StateCommand::ListRecords {
                agent,
                limit,
                offset,
                status,
                reply,
            } => {
                debug!(%agent, "actor_loop: ListRecords command");
                let _ = reply.send(ledger.list_records(&agent, limit, offset, status).map_err(store_err));
            }

            StateCommand::GetBudgetWindow { name, now, reply } => {
                debug!(%name, "actor_loop: GetBudgetWindow command");
                let _ = reply.send(ledger.budget_window(&name, now).map_err(store_err));
            }

            StateCommand::StatusSnapshot { reply } => {
                debug!("actor_loop: StatusSnapshot command");
                let _ = reply.send(ledger.status_snapshot().map_err(store_err));
            }

            StateCommand::RollupsSince { since, reply } => {
                debug!(since, "actor_loop: RollupsSince command");
                let _ = reply.send(ledger.rollups_since(since).map_err(store_err));
            }

            StateCommand::CostReport { since, reply } => {
                debug!(?since, "actor_loop: CostReport command");
                let _ = reply.send(ledger.cost_report(since).map_err(store_err));
            }

            StateCommand::SweepOrphans { message, now, reply } => {
                debug!("actor_loop: SweepOrphans command");
                let _ = reply.send(ledger.sweep_orphaned_running(&message, now).map_err(store_err));
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use runledger::{AdmissionRejection, Schedule, now_ms};

    fn spawn_manager() -> StateManager {
        StateManager::spawn_with(Ledger::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_agent_crud_through_actor() {
        let manager = spawn_manager();

        let def = AgentDef::new("scraper", "anthropic", "claude-sonnet-4")
            .with_schedule(Schedule::Interval { hours: 6.0 });
        manager.create_agent(def.clone()).await.unwrap();

        let loaded = manager.get_agent("scraper").await.unwrap().unwrap();
        assert_eq!(loaded.schedule, Schedule::Interval { hours: 6.0 });

        let mut updated = loaded;
        updated.prompt = "new prompt".to_string();
        manager.update_agent(updated).await.unwrap();
        assert_eq!(manager.get_agent("scraper").await.unwrap().unwrap().prompt, "new prompt");

        let agents = manager.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);

        assert_eq!(manager.delete_agent("scraper").await.unwrap(), DeleteOutcome::Deleted);
        assert!(manager.get_agent("scraper").await.unwrap().is_none());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_unknown_agent_is_not_found() {
        let manager = spawn_manager();
        let def = AgentDef::new("ghost", "anthropic", "m");
        let result = manager.update_agent(def).await;
        assert!(matches!(result, Err(StateError::NotFound(_))));
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_admit_and_finalize_through_actor() {
        let manager = spawn_manager();
        manager.create_agent(AgentDef::new("a", "anthropic", "m")).await.unwrap();
        let now = now_ms();

        let AdmitOutcome::Admitted(record) = manager.admit_run("a", "manual", now).await.unwrap() else {
            panic!("expected admission");
        };

        // Second admission is rejected while the first is running
        let outcome = manager.admit_run("a", "scheduler", now).await.unwrap();
        assert!(matches!(
            outcome,
            AdmitOutcome::Rejected(AdmissionRejection::AlreadyRunning)
        ));

        let applied = manager
            .finalize_run(&record.id, "a", RunOutcome::completed(1, 500, 0.05), now + 2000)
            .await
            .unwrap();
        assert!(applied);

        let latest = manager.latest_record("a").await.unwrap().unwrap();
        assert_eq!(latest.status, ExecutionStatus::Completed);
        assert_eq!(latest.tokens_used, 500);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_broadcast_on_admit_and_finalize() {
        let manager = spawn_manager();
        manager.create_agent(AgentDef::new("a", "anthropic", "m")).await.unwrap();
        let mut events = manager.subscribe_events();
        let now = now_ms();

        let AdmitOutcome::Admitted(record) = manager.admit_run("a", "manual", now).await.unwrap() else {
            panic!("expected admission");
        };
        manager
            .finalize_run(&record.id, "a", RunOutcome::failed("boom"), now + 100)
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, StateEvent::ExecutionStarted { ref agent, .. } if agent == "a"));
        let second = events.recv().await.unwrap();
        assert!(matches!(
            second,
            StateEvent::ExecutionFinalized {
                status: ExecutionStatus::Failed,
                ..
            }
        ));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_agent_required() {
        let manager = spawn_manager();
        let result = manager.get_agent_required("missing").await;
        assert!(matches!(result, Err(StateError::NotFound(_))));
        manager.shutdown().await.unwrap();
    }
}
