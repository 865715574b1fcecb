//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use runledger::{
    AdmitOutcome, AgentDef, AgentRollup, AgentStatusRow, BudgetWindow, CostReportRow, DeleteOutcome, ExecutionRecord,
    ExecutionStatus, RunOutcome,
};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Agent definition operations
    CreateAgent {
        def: AgentDef,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetAgent {
        name: String,
        reply: oneshot::Sender<StateResponse<Option<AgentDef>>>,
    },
    UpdateAgent {
        def: AgentDef,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    DeleteAgent {
        name: String,
        reply: oneshot::Sender<StateResponse<DeleteOutcome>>,
    },
    ListAgents {
        reply: oneshot::Sender<StateResponse<Vec<AgentDef>>>,
    },
    SetEnabled {
        name: String,
        enabled: bool,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    SetPaused {
        name: String,
        paused: bool,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    AdvanceSchedule {
        name: String,
        last_run_at: i64,
        next_run_at: Option<i64>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    SetNextRun {
        name: String,
        next_run_at: Option<i64>,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Admission and finalization
    AdmitRun {
        name: String,
        source: String,
        now: i64,
        reply: oneshot::Sender<StateResponse<AdmitOutcome>>,
    },
    FinalizeRun {
        id: String,
        outcome: RunOutcome,
        finished_at: i64,
        reply: oneshot::Sender<StateResponse<bool>>,
    },

    // Execution record queries
    GetRecord {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<ExecutionRecord>>>,
    },
    LatestRecord {
        agent: String,
        reply: oneshot::Sender<StateResponse<Option<ExecutionRecord>>>,
    },
    RunningRecord {
        agent: String,
        reply: oneshot::Sender<StateResponse<Option<ExecutionRecord>>>,
    },
    ListRecords {
        agent: String,
        limit: u32,
        offset: u32,
        status: Option<ExecutionStatus>,
        reply: oneshot::Sender<StateResponse<(Vec<ExecutionRecord>, u64)>>,
    },

    // Aggregates
    GetBudgetWindow {
        name: String,
        now: i64,
        reply: oneshot::Sender<StateResponse<Option<BudgetWindow>>>,
    },
    StatusSnapshot {
        reply: oneshot::Sender<StateResponse<Vec<AgentStatusRow>>>,
    },
    RollupsSince {
        since: i64,
        reply: oneshot::Sender<StateResponse<Vec<AgentRollup>>>,
    },
    CostReport {
        since: Option<i64>,
        reply: oneshot::Sender<StateResponse<Vec<CostReportRow>>>,
    },

    // Startup recovery
    SweepOrphans {
        message: String,
        now: i64,
        reply: oneshot::Sender<StateResponse<usize>>,
    },

    // Shutdown
    Shutdown,
}
