//! RunLedger - durable execution ledger for agent orchestration
//!
//! Owns the two persisted tables of the control plane:
//!
//! - `agents`: one row per agent definition
//! - `executions`: append-mostly, one row per run
//!
//! Runtime state is never persisted separately; it is always derived from
//! these two tables. The ledger is the single source of truth for rate/cost
//! budgets and for the "is an agent currently running" question.

mod ledger;
mod types;

pub use ledger::{DeleteOutcome, Ledger};
pub use types::{
    AdmissionRejection, AdmitOutcome, AgentDef, AgentRollup, AgentStatusRow, BudgetWindow, CostReportRow,
    ExecutionRecord, ExecutionStatus, RunOutcome, Schedule, ERROR_MESSAGE_MAX,
};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Start of the UTC calendar day containing `now` (Unix milliseconds)
pub fn day_start_ms(now: i64) -> i64 {
    chrono::DateTime::from_timestamp_millis(now)
        .and_then(|dt| dt.date_naive().and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc().timestamp_millis())
        .unwrap_or(now)
}

/// One rolling hour in milliseconds (the rate-limit window)
pub const HOUR_MS: i64 = 60 * 60 * 1000;
