//! Control surface
//!
//! The transport-agnostic operation set exposed to operators: agent CRUD,
//! enable/pause/resume, manual triggers, execution logs, the metrics
//! stream, and cost reporting. Authentication lives outside this component;
//! it is consumed here as a capability check on every mutation.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use runledger::{
    AgentDef, AgentRollup, BudgetWindow, CostReportRow, DeleteOutcome, ExecutionRecord, ExecutionStatus, Schedule,
    day_start_ms, now_ms,
};

use crate::runtime::{RuntimeState, derive_state};
use crate::scheduler::{compute_next_run, cron};
use crate::state::{StateError, StateManager};
use crate::telemetry::{CapacityRejected, MetricsBroadcaster, MetricsStream};
use crate::trigger::{TriggerGateway, TriggerOutcome, TriggerResponse};

/// The caller identity handed in by the authentication collaborator
#[derive(Debug, Clone)]
pub struct Caller {
    pub subject: String,
    pub operator: bool,
}

impl Caller {
    /// A caller holding the operator capability
    pub fn operator(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            operator: true,
        }
    }

    /// A read-only caller
    pub fn readonly(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            operator: false,
        }
    }
}

/// Errors surfaced by control-plane operations
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Operator capability required")]
    Forbidden,

    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Invalid agent configuration: {0}")]
    Invalid(String),

    #[error("Agent has execution records and cannot be deleted")]
    DeleteRestricted,

    #[error(transparent)]
    Capacity(#[from] CapacityRejected),

    #[error("State error: {0}")]
    State(StateError),
}

impl From<StateError> for ControlError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(name) => Self::NotFound(name),
            other => Self::State(other),
        }
    }
}

/// An agent definition with its derived runtime state and budget window
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub def: AgentDef,
    pub state: RuntimeState,
    pub budget: Option<BudgetWindow>,
}

/// Partial update for an agent definition; None leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentPatch {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub prompt: Option<String>,
    pub rate_limit_per_hour: Option<u32>,
    pub cost_limit_daily: Option<f64>,
    pub schedule: Option<Schedule>,
}

impl AgentPatch {
    /// Apply the patch, returning whether the schedule shape changed
    fn apply(self, def: &mut AgentDef) -> bool {
        if let Some(provider) = self.provider {
            def.provider = provider;
        }
        if let Some(model) = self.model {
            def.model = model;
        }
        if let Some(temperature) = self.temperature {
            def.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            def.max_tokens = max_tokens;
        }
        if let Some(prompt) = self.prompt {
            def.prompt = prompt;
        }
        if let Some(rate_limit) = self.rate_limit_per_hour {
            def.rate_limit_per_hour = rate_limit;
        }
        if let Some(cost_limit) = self.cost_limit_daily {
            def.cost_limit_daily = cost_limit;
        }
        let schedule_changed = match self.schedule {
            Some(schedule) if schedule != def.schedule => {
                def.schedule = schedule;
                true
            }
            _ => false,
        };
        def.touch();
        schedule_changed
    }
}

/// Reporting window for cost_report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportPeriod {
    #[default]
    Day,
    Week,
    Month,
    All,
}

impl ReportPeriod {
    /// Lower bound of the window (Unix ms), None for All
    pub fn since(&self, now: i64) -> Option<i64> {
        const DAY_MS: i64 = 24 * 60 * 60 * 1000;
        match self {
            Self::Day => Some(day_start_ms(now)),
            Self::Week => Some(now - 7 * DAY_MS),
            Self::Month => Some(now - 30 * DAY_MS),
            Self::All => None,
        }
    }
}

impl std::str::FromStr for ReportPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" | "today" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "all" => Ok(Self::All),
            _ => Err(format!("Unknown period: {}. Use: day, week, month, or all", s)),
        }
    }
}

/// The control plane facade
#[derive(Clone)]
pub struct ControlPlane {
    state: StateManager,
    trigger: TriggerGateway,
    telemetry: MetricsBroadcaster,
}

impl ControlPlane {
    /// Assemble the control plane from its wired components
    pub fn new(state: StateManager, trigger: TriggerGateway, telemetry: MetricsBroadcaster) -> Self {
        Self {
            state,
            trigger,
            telemetry,
        }
    }

    fn require_operator(caller: &Caller) -> Result<(), ControlError> {
        if caller.operator {
            Ok(())
        } else {
            debug!(subject = %caller.subject, "require_operator: rejected");
            Err(ControlError::Forbidden)
        }
    }

    /// All agent definitions with derived runtime state and current budgets
    pub async fn list_agents(&self) -> Result<Vec<AgentView>, ControlError> {
        debug!("list_agents: called");
        let now = now_ms();
        let agents = self.state.list_agents().await?;
        let statuses = self.state.status_snapshot().await?;

        let mut views = Vec::with_capacity(agents.len());
        for def in agents {
            let last_status = statuses.iter().find(|row| row.agent == def.name).map(|row| row.last_status);
            let state = derive_state(&def, last_status);
            let budget = self.state.budget_window(&def.name, now).await?;
            views.push(AgentView { def, state, budget });
        }
        Ok(views)
    }

    /// One agent with derived state
    pub async fn get_agent(&self, name: &str) -> Result<AgentView, ControlError> {
        debug!(%name, "get_agent: called");
        let def = self.state.get_agent_required(name).await?;
        let latest = self.state.latest_record(name).await?;
        let state = derive_state(&def, latest.map(|record| record.status));
        let budget = self.state.budget_window(name, now_ms()).await?;
        Ok(AgentView { def, state, budget })
    }

    /// Create a new agent
    pub async fn create_agent(&self, caller: &Caller, def: AgentDef) -> Result<(), ControlError> {
        Self::require_operator(caller)?;
        validate_def(&def)?;
        info!(agent = %def.name, subject = %caller.subject, "Creating agent");

        let seed = initial_next_run(&def);
        let name = def.name.clone();
        self.state
            .create_agent(def)
            .await
            .map_err(|e| match e {
                StateError::StoreError(message) if message.contains("already exists") => {
                    ControlError::Invalid(message)
                }
                other => other.into(),
            })?;
        if let Some(next) = seed {
            self.state.set_next_run(&name, Some(next)).await?;
        }
        Ok(())
    }

    /// Apply a partial update to an agent
    pub async fn update_agent(&self, caller: &Caller, name: &str, patch: AgentPatch) -> Result<AgentView, ControlError> {
        Self::require_operator(caller)?;
        let mut def = self.state.get_agent_required(name).await?;

        let schedule_changed = patch.apply(&mut def);
        validate_def(&def)?;
        if schedule_changed {
            // A new schedule shape restarts the automatic clock
            def.next_run_at = initial_next_run(&def);
        }
        info!(agent = %name, subject = %caller.subject, schedule_changed, "Updating agent");

        self.state.update_agent(def).await?;
        self.get_agent(name).await
    }

    /// Delete an agent; restricted while execution records reference it
    pub async fn delete_agent(&self, caller: &Caller, name: &str) -> Result<(), ControlError> {
        Self::require_operator(caller)?;
        info!(agent = %name, subject = %caller.subject, "Deleting agent");
        match self.state.delete_agent(name).await? {
            DeleteOutcome::Deleted => Ok(()),
            DeleteOutcome::NotFound => Err(ControlError::NotFound(name.to_string())),
            DeleteOutcome::HasRecords => Err(ControlError::DeleteRestricted),
        }
    }

    /// Enable or disable an agent
    pub async fn set_enabled(&self, caller: &Caller, name: &str, enabled: bool) -> Result<(), ControlError> {
        Self::require_operator(caller)?;
        info!(agent = %name, enabled, subject = %caller.subject, "Setting enabled flag");
        self.state.set_enabled(name, enabled).await?;

        // Re-enabling an automatic agent restarts its clock
        if enabled {
            let def = self.state.get_agent_required(name).await?;
            if def.next_run_at.is_none()
                && let Some(next) = initial_next_run(&def)
            {
                self.state.set_next_run(name, Some(next)).await?;
            }
        }
        Ok(())
    }

    /// Pause an agent: the scheduler skips it, manual triggers still work,
    /// and an in-flight execution is not cancelled
    pub async fn pause(&self, caller: &Caller, name: &str) -> Result<(), ControlError> {
        Self::require_operator(caller)?;
        info!(agent = %name, subject = %caller.subject, "Pausing agent");
        Ok(self.state.set_paused(name, true).await?)
    }

    /// Resume a paused agent
    pub async fn resume(&self, caller: &Caller, name: &str) -> Result<(), ControlError> {
        Self::require_operator(caller)?;
        info!(agent = %name, subject = %caller.subject, "Resuming agent");
        Ok(self.state.set_paused(name, false).await?)
    }

    /// Trigger an immediate run through the shared admission gate
    pub async fn trigger(&self, caller: &Caller, name: &str) -> Result<TriggerResponse, ControlError> {
        Self::require_operator(caller)?;
        Ok(self.trigger.trigger(name).await?)
    }

    /// Bounded poll for a triggered run's outcome
    pub async fn await_trigger_outcome(&self, execution_id: &str) -> Result<TriggerOutcome, ControlError> {
        Ok(self.trigger.await_outcome(execution_id).await?)
    }

    /// Execution records for an agent, newest first, with the total count
    pub async fn get_logs(
        &self,
        name: &str,
        limit: u32,
        offset: u32,
        status: Option<ExecutionStatus>,
    ) -> Result<(Vec<ExecutionRecord>, u64), ControlError> {
        debug!(%name, limit, offset, ?status, "get_logs: called");
        // Distinguish "unknown agent" from "agent with no records"
        self.state.get_agent_required(name).await?;
        Ok(self.state.list_records(name, limit, offset, status).await?)
    }

    /// Open a live metrics stream; fails closed at the channel cap
    pub fn subscribe_metrics(&self) -> Result<MetricsStream, ControlError> {
        debug!("subscribe_metrics: called");
        Ok(self.telemetry.subscribe()?)
    }

    /// Aggregated cost/tokens/execution counts grouped by agent
    pub async fn cost_report(&self, period: ReportPeriod) -> Result<Vec<CostReportRow>, ControlError> {
        debug!(?period, "cost_report: called");
        Ok(self.state.cost_report(period.since(now_ms())).await?)
    }

    /// Today's per-agent rollup counters
    pub async fn rollups_today(&self) -> Result<Vec<AgentRollup>, ControlError> {
        Ok(self.state.rollups_since(day_start_ms(now_ms())).await?)
    }
}

/// Reject definitions that could never run correctly
fn validate_def(def: &AgentDef) -> Result<(), ControlError> {
    if def.name.is_empty() {
        return Err(ControlError::Invalid("agent name must not be empty".to_string()));
    }
    if !def.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ControlError::Invalid(format!(
            "agent name '{}' may only contain alphanumerics, '_' and '-'",
            def.name
        )));
    }
    if def.max_tokens == 0 {
        return Err(ControlError::Invalid("max_tokens must be positive".to_string()));
    }
    match &def.schedule {
        Schedule::Manual => {}
        Schedule::Interval { hours } => {
            if *hours <= 0.0 {
                return Err(ControlError::Invalid("interval hours must be positive".to_string()));
            }
        }
        Schedule::Cron { expression } => {
            if cron::parse(expression).is_none() {
                return Err(ControlError::Invalid(format!("invalid cron expression: '{}'", expression)));
            }
        }
    }
    Ok(())
}

/// next_run_at for a newly created or rescheduled agent
fn initial_next_run(def: &AgentDef) -> Option<i64> {
    if !def.enabled || def.schedule.is_manual() {
        return None;
    }
    compute_next_run(&def.schedule, now_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use runledger::{AdmissionRejection, Ledger, RunOutcome};

    use crate::config::{ExecutorConfig, SchedulerConfig, TelemetryConfig, TriggerConfig};
    use crate::executor::RunExecutor;
    use crate::provider::{InvocationOutput, InvocationRequest, Provider, ProviderError, ProviderRegistry};

    struct StubProvider;

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn invoke(&self, _request: &InvocationRequest) -> Result<InvocationOutput, ProviderError> {
            Ok(InvocationOutput {
                items_processed: 1,
                items_failed: 0,
                tokens_used: 10,
                cost_usd: 0.1,
            })
        }
    }

    fn control_plane() -> (ControlPlane, StateManager) {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let executor = RunExecutor::new(
            state.clone(),
            ExecutorConfig {
                min_spacing_ms: 0,
                ..Default::default()
            },
        );
        let mut registry = ProviderRegistry::default();
        registry.insert(Arc::new(StubProvider));
        let trigger = TriggerGateway::new(
            state.clone(),
            executor,
            registry,
            SchedulerConfig::default(),
            TriggerConfig::default(),
        );
        let telemetry = MetricsBroadcaster::new(
            state.clone(),
            TelemetryConfig {
                tick_secs: 5,
                channel_cap: 2,
            },
        );
        (ControlPlane::new(state.clone(), trigger, telemetry), state)
    }

    fn stub_agent(name: &str) -> AgentDef {
        AgentDef::new(name, "stub", "stub-model")
    }

    #[tokio::test]
    async fn test_mutations_require_operator_capability() {
        let (plane, _state) = control_plane();
        let reader = Caller::readonly("dashboard");

        assert!(matches!(
            plane.create_agent(&reader, stub_agent("a")).await,
            Err(ControlError::Forbidden)
        ));
        assert!(matches!(
            plane.update_agent(&reader, "a", AgentPatch::default()).await,
            Err(ControlError::Forbidden)
        ));
        assert!(matches!(
            plane.delete_agent(&reader, "a").await,
            Err(ControlError::Forbidden)
        ));
        assert!(matches!(
            plane.set_enabled(&reader, "a", false).await,
            Err(ControlError::Forbidden)
        ));
        assert!(matches!(plane.pause(&reader, "a").await, Err(ControlError::Forbidden)));
        assert!(matches!(plane.resume(&reader, "a").await, Err(ControlError::Forbidden)));
        assert!(matches!(plane.trigger(&reader, "a").await, Err(ControlError::Forbidden)));
    }

    #[tokio::test]
    async fn test_create_and_list_with_derived_state() {
        let (plane, _state) = control_plane();
        let operator = Caller::operator("alice");

        plane
            .create_agent(&operator, stub_agent("a").with_schedule(Schedule::Interval { hours: 6.0 }))
            .await
            .unwrap();

        let views = plane.list_agents().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].state, RuntimeState::Idle);
        // Interval agents get their clock seeded at creation
        assert!(views[0].def.next_run_at.is_some());
        // And a budget window comes along for display
        assert_eq!(views[0].budget.as_ref().unwrap().rate_count, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_definitions() {
        let (plane, _state) = control_plane();
        let operator = Caller::operator("alice");

        let mut bad_name = stub_agent("has spaces");
        bad_name.prompt = "x".to_string();
        assert!(matches!(
            plane.create_agent(&operator, bad_name).await,
            Err(ControlError::Invalid(_))
        ));

        let bad_cron = stub_agent("a").with_schedule(Schedule::Cron {
            expression: "not a cron".to_string(),
        });
        assert!(matches!(
            plane.create_agent(&operator, bad_cron).await,
            Err(ControlError::Invalid(_))
        ));

        let bad_interval = stub_agent("a").with_schedule(Schedule::Interval { hours: 0.0 });
        assert!(matches!(
            plane.create_agent(&operator, bad_interval).await,
            Err(ControlError::Invalid(_))
        ));

        plane.create_agent(&operator, stub_agent("a")).await.unwrap();
        assert!(matches!(
            plane.create_agent(&operator, stub_agent("a")).await,
            Err(ControlError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_update_patch_and_schedule_reseed() {
        let (plane, _state) = control_plane();
        let operator = Caller::operator("alice");

        plane.create_agent(&operator, stub_agent("a")).await.unwrap();

        let view = plane
            .update_agent(
                &operator,
                "a",
                AgentPatch {
                    temperature: Some(0.2),
                    schedule: Some(Schedule::Interval { hours: 2.0 }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(view.def.temperature, 0.2);
        assert_eq!(view.def.schedule, Schedule::Interval { hours: 2.0 });
        // Switching manual -> interval seeds the clock
        assert!(view.def.next_run_at.is_some());

        assert!(matches!(
            plane.update_agent(&operator, "ghost", AgentPatch::default()).await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_restricted_with_records() {
        let (plane, state) = control_plane();
        let operator = Caller::operator("alice");

        plane.create_agent(&operator, stub_agent("a")).await.unwrap();
        let runledger::AdmitOutcome::Admitted(record) = state.admit_run("a", "manual", now_ms()).await.unwrap() else {
            panic!("expected admission");
        };
        state
            .finalize_run(&record.id, "a", RunOutcome::completed(1, 1, 0.0), now_ms())
            .await
            .unwrap();

        assert!(matches!(
            plane.delete_agent(&operator, "a").await,
            Err(ControlError::DeleteRestricted)
        ));

        plane.create_agent(&operator, stub_agent("b")).await.unwrap();
        plane.delete_agent(&operator, "b").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_roundtrip() {
        let (plane, _state) = control_plane();
        let operator = Caller::operator("alice");

        plane.create_agent(&operator, stub_agent("a")).await.unwrap();

        let TriggerResponse::Accepted { execution_id } = plane.trigger(&operator, "a").await.unwrap() else {
            panic!("expected acceptance");
        };
        let outcome = plane.await_trigger_outcome(&execution_id).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Completed(_)));

        let (records, total) = plane.get_logs("a", 10, 0, None).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_trigger_disabled_is_typed_rejection() {
        let (plane, _state) = control_plane();
        let operator = Caller::operator("alice");

        plane.create_agent(&operator, stub_agent("a")).await.unwrap();
        plane.set_enabled(&operator, "a", false).await.unwrap();

        let response = plane.trigger(&operator, "a").await.unwrap();
        assert!(matches!(
            response,
            TriggerResponse::Rejected(AdmissionRejection::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_get_logs_unknown_agent() {
        let (plane, _state) = control_plane();
        assert!(matches!(
            plane.get_logs("ghost", 10, 0, None).await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_metrics_cap() {
        let (plane, _state) = control_plane();

        let _first = plane.subscribe_metrics().unwrap();
        let _second = plane.subscribe_metrics().unwrap();
        assert!(matches!(
            plane.subscribe_metrics(),
            Err(ControlError::Capacity(CapacityRejected { cap: 2 }))
        ));
    }

    #[tokio::test]
    async fn test_cost_report_periods() {
        let (plane, state) = control_plane();
        let operator = Caller::operator("alice");

        plane.create_agent(&operator, stub_agent("a")).await.unwrap();
        let runledger::AdmitOutcome::Admitted(record) = state.admit_run("a", "manual", now_ms()).await.unwrap() else {
            panic!("expected admission");
        };
        state
            .finalize_run(&record.id, "a", RunOutcome::completed(1, 500, 0.5), now_ms())
            .await
            .unwrap();

        for period in [ReportPeriod::Day, ReportPeriod::Week, ReportPeriod::Month, ReportPeriod::All] {
            let report = plane.cost_report(period).await.unwrap();
            assert_eq!(report.len(), 1, "period {:?}", period);
            assert_eq!(report[0].tokens_used, 500);
        }
    }

    #[test]
    fn test_report_period_parsing() {
        assert_eq!("day".parse::<ReportPeriod>().unwrap(), ReportPeriod::Day);
        assert_eq!("WEEK".parse::<ReportPeriod>().unwrap(), ReportPeriod::Week);
        assert_eq!("month".parse::<ReportPeriod>().unwrap(), ReportPeriod::Month);
        assert_eq!("all".parse::<ReportPeriod>().unwrap(), ReportPeriod::All);
        assert!("fortnight".parse::<ReportPeriod>().is_err());
    }
}
