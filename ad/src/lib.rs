//! AgentDaemon - Agent Orchestration & Runtime Control Plane
//!
//! AgentDaemon runs many independently-configured agents, each wrapping a
//! call to an external generative-AI provider, under per-agent concurrency,
//! rate, and cost limits. Transient provider failures are retried with
//! backoff and provider fallback; a bounded telemetry channel feeds operator
//! dashboards without leaking connections or database resources.
//!
//! # Core Concepts
//!
//! - **Durable ledger**: the executions table is the single source of truth
//!   for budgets and for "is this agent running"
//! - **Atomic admission**: enabled check, single-flight check, budget check,
//!   and record creation happen as one conditional write
//! - **Derived state**: per-agent runtime state is always computed from the
//!   ledger, never held in memory where it could drift
//! - **Fail-closed limits**: budget and channel caps reject, never queue
//!
//! # Modules
//!
//! - [`state`] - actor owning the persistent ledger
//! - [`runtime`] - derived runtime state
//! - [`provider`] - provider clients and failure classification
//! - [`executor`] - retry/backoff execution of admitted runs
//! - [`scheduler`] - periodic tick and cron computation
//! - [`trigger`] - operator-initiated runs
//! - [`telemetry`] - bounded metrics broadcasting
//! - [`control`] - the operator-facing operation surface
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod executor;
pub mod provider;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod telemetry;
pub mod trigger;

// Re-export commonly used types
pub use config::{Config, ExecutorConfig, ProviderConfig, ProviderKind, SchedulerConfig, StorageConfig,
                 TelemetryConfig, TriggerConfig};
pub use control::{AgentPatch, AgentView, Caller, ControlError, ControlPlane, ReportPeriod};
pub use executor::RunExecutor;
pub use provider::{InvocationOutput, InvocationRequest, Provider, ProviderError, ProviderRegistry, create_provider};
pub use runtime::{RuntimeState, derive_state};
pub use scheduler::{SOURCE_SCHEDULER, Scheduler, compute_next_run};
pub use state::{StateError, StateEvent, StateManager};
pub use telemetry::{AgentMetrics, CapacityRejected, MetricsBroadcaster, MetricsSnapshot, MetricsStream};
pub use trigger::{SOURCE_MANUAL, TriggerGateway, TriggerOutcome, TriggerResponse};

// Re-export the ledger's persisted types for convenience
pub use runledger::{
    AdmissionRejection, AdmitOutcome, AgentDef, AgentRollup, AgentStatusRow, BudgetWindow, CostReportRow,
    ExecutionRecord, ExecutionStatus, Ledger, RunOutcome, Schedule, now_ms,
};
