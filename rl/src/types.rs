//! Persisted domain types
//!
//! AgentDef and ExecutionRecord are the only durable state in the system.

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_ms;

/// Maximum stored length for an execution error message
pub const ERROR_MESSAGE_MAX: usize = 500;

/// When and how an agent runs
///
/// Tagged union so that invalid combinations (e.g. a cron expression on a
/// manual agent) are unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Only runs when an operator triggers it
    Manual,
    /// Runs every `hours` hours
    Interval { hours: f64 },
    /// Runs on a 5-field cron expression ("MIN HOUR DOM MON DOW")
    Cron { expression: String },
}

impl Schedule {
    /// Schedule kind as stored in the `schedule_type` column
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Interval { .. } => "interval",
            Self::Cron { .. } => "cron",
        }
    }

    /// Schedule parameter as stored in the `schedule_param` column
    pub fn param(&self) -> Option<String> {
        match self {
            Self::Manual => None,
            Self::Interval { hours } => Some(hours.to_string()),
            Self::Cron { expression } => Some(expression.clone()),
        }
    }

    /// Rebuild from the two columns
    pub fn from_parts(kind: &str, param: Option<&str>) -> Result<Self> {
        match kind {
            "manual" => Ok(Self::Manual),
            "interval" => {
                let hours: f64 = param
                    .ok_or_else(|| eyre!("interval schedule missing hours"))?
                    .parse()
                    .map_err(|_| eyre!("invalid interval hours: {:?}", param))?;
                Ok(Self::Interval { hours })
            }
            "cron" => Ok(Self::Cron {
                expression: param.ok_or_else(|| eyre!("cron schedule missing expression"))?.to_string(),
            }),
            other => Err(eyre!("unknown schedule type: {}", other)),
        }
    }

    /// Whether the scheduler should ever touch this agent
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }
}

/// An agent definition - one row in the `agents` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDef {
    /// Unique name, primary key
    pub name: String,

    /// Provider reference ("anthropic", "openai", ...)
    pub provider: String,

    /// Model identifier passed to the provider
    pub model: String,

    /// Sampling temperature
    pub temperature: f64,

    /// Maximum output size per call
    pub max_tokens: u32,

    /// Free-text behavior prompt/description
    pub prompt: String,

    /// Rolling-hour admission limit
    pub rate_limit_per_hour: u32,

    /// Daily cost cap in USD
    pub cost_limit_daily: f64,

    /// When and how the agent runs
    pub schedule: Schedule,

    /// Disabled agents are rejected on every admission path
    pub enabled: bool,

    /// Paused agents are skipped by the scheduler but remain manually triggerable
    pub paused: bool,

    /// Next scheduler-computed run (Unix ms, None for manual agents)
    pub next_run_at: Option<i64>,

    /// Last scheduler-initiated run (Unix ms)
    pub last_run_at: Option<i64>,

    /// Creation timestamp (Unix ms)
    pub created_at: i64,

    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl AgentDef {
    /// Create a new enabled, manual-schedule agent with defaults
    pub fn new(name: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            name: name.into(),
            provider: provider.into(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: 4096,
            prompt: String::new(),
            rate_limit_per_hour: 10,
            cost_limit_daily: 5.0,
            schedule: Schedule::Manual,
            enabled: true,
            paused: false,
            next_run_at: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the schedule
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Builder: set the budget limits
    pub fn with_limits(mut self, rate_limit_per_hour: u32, cost_limit_daily: f64) -> Self {
        self.rate_limit_per_hour = rate_limit_per_hour;
        self.cost_limit_daily = cost_limit_daily;
        self
    }

    /// Builder: set the behavior prompt
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Bump the updated_at timestamp
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// Execution record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Admitted, executor owns the record
    Running,
    /// Finished successfully
    Completed,
    /// Provider exhaustion, fatal error, or timeout
    Failed,
}

impl ExecutionStatus {
    /// Immutable-once-terminal check
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Parse from the stored column value
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(eyre!("unknown execution status: {}", other)),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One run of one agent - a row in the `executions` table
///
/// Created at admission time with status=running; finalized exactly once by
/// the executor that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique identifier (UUIDv7, so ids sort by creation time)
    pub id: String,

    /// Agent name (foreign key)
    pub agent: String,

    /// Current status
    pub status: ExecutionStatus,

    /// Provenance tag ("scheduler", "manual", ...)
    pub source: String,

    /// Admission timestamp (Unix ms)
    pub started_at: i64,

    /// Finalization timestamp (Unix ms, None while running)
    pub finished_at: Option<i64>,

    /// Work items handled by the run
    pub items_processed: i64,

    /// Work items that failed within the run
    pub items_failed: i64,

    /// Wall-clock duration (ms)
    pub duration_ms: i64,

    /// Tokens consumed, from the actual provider response
    pub tokens_used: i64,

    /// Cost in USD, from the actual provider response
    pub cost_usd: f64,

    /// Truncated error message (None on success)
    pub error_message: Option<String>,
}

impl ExecutionRecord {
    /// Create a fresh running record at admission time
    pub fn start(agent: impl Into<String>, source: impl Into<String>, started_at: i64) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            agent: agent.into(),
            status: ExecutionStatus::Running,
            source: source.into(),
            started_at,
            finished_at: None,
            items_processed: 0,
            items_failed: 0,
            duration_ms: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            error_message: None,
        }
    }

    /// Whether this record still accepts a finalization
    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }
}

/// Terminal outcome applied to a running record
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub items_processed: i64,
    pub items_failed: i64,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub error_message: Option<String>,
}

impl RunOutcome {
    /// A successful outcome
    pub fn completed(items_processed: i64, tokens_used: i64, cost_usd: f64) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            items_processed,
            items_failed: 0,
            tokens_used,
            cost_usd,
            error_message: None,
        }
    }

    /// A failed outcome; the message is truncated to ERROR_MESSAGE_MAX
    pub fn failed(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > ERROR_MESSAGE_MAX {
            // Truncate on a char boundary
            let mut end = ERROR_MESSAGE_MAX;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self {
            status: ExecutionStatus::Failed,
            items_processed: 0,
            items_failed: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            error_message: Some(message),
        }
    }

    /// Builder: attach usage observed before the failure
    pub fn with_usage(mut self, tokens_used: i64, cost_usd: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self
    }
}

/// Why an admission attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionRejection {
    /// Agent has enabled=false
    Disabled,
    /// A running record already exists for the agent
    AlreadyRunning,
    /// Rolling-hour rate limit reached
    RateLimited,
    /// Daily cost cap reached
    CostCapped,
}

impl std::fmt::Display for AdmissionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::AlreadyRunning => write!(f, "already_running"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::CostCapped => write!(f, "cost_capped"),
        }
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    /// Record created; the caller now owns its finalization
    Admitted(ExecutionRecord),
    /// No record created
    Rejected(AdmissionRejection),
}

/// The rolling-hour rate count and daily cost sum that gate admission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetWindow {
    /// Records started in the last hour
    pub rate_count: u32,
    /// The agent's rate_limit_per_hour
    pub rate_limit: u32,
    /// Cost of records started since the start of the UTC day
    pub cost_sum: f64,
    /// The agent's cost_limit_daily
    pub cost_limit: f64,
    /// Cost of the most recent completed run; used to anticipate the spend
    /// of the run being admitted (0.0 when the agent has no history)
    pub projected_cost: f64,
}

impl BudgetWindow {
    /// Rate check: strictly fewer starts than the limit
    pub fn permits_rate(&self) -> bool {
        self.rate_count < self.rate_limit
    }

    /// Cost check: today's spend plus the anticipated run cost must not
    /// exceed the cap
    pub fn permits_cost(&self) -> bool {
        self.cost_sum + self.projected_cost <= self.cost_limit
    }
}

/// Latest execution per agent, for the telemetry snapshot
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusRow {
    pub agent: String,
    pub last_status: ExecutionStatus,
    pub last_started_at: i64,
    pub last_error: Option<String>,
}

/// Per-agent daily counters, for the telemetry snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentRollup {
    pub agent: String,
    pub executions: u64,
    pub items_processed: i64,
    pub cost_usd: f64,
    pub errors: u64,
}

/// Per-agent aggregation for the cost report
#[derive(Debug, Clone, Serialize)]
pub struct CostReportRow {
    pub agent: String,
    pub executions: u64,
    pub failures: u64,
    pub tokens_used: i64,
    pub cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_roundtrip_through_columns() {
        for schedule in [
            Schedule::Manual,
            Schedule::Interval { hours: 6.0 },
            Schedule::Cron {
                expression: "0 8 * * *".to_string(),
            },
        ] {
            let rebuilt = Schedule::from_parts(schedule.kind(), schedule.param().as_deref()).unwrap();
            assert_eq!(rebuilt, schedule);
        }
    }

    #[test]
    fn test_schedule_rejects_invalid_parts() {
        assert!(Schedule::from_parts("interval", None).is_err());
        assert!(Schedule::from_parts("interval", Some("six")).is_err());
        assert!(Schedule::from_parts("cron", None).is_err());
        assert!(Schedule::from_parts("hourly", Some("1")).is_err());
    }

    #[test]
    fn test_schedule_serde_tagged() {
        let json = serde_json::to_string(&Schedule::Interval { hours: 6.0 }).unwrap();
        assert!(json.contains("\"type\":\"interval\""));

        let manual: Schedule = serde_json::from_str(r#"{"type":"manual"}"#).unwrap();
        assert!(manual.is_manual());
    }

    #[test]
    fn test_execution_record_start() {
        let record = ExecutionRecord::start("reddit_scraper", "manual", 1000);
        assert_eq!(record.agent, "reddit_scraper");
        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(record.is_running());
        assert!(record.finished_at.is_none());
        assert!(!record.id.is_empty());
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_execution_status_parse_display() {
        for status in [ExecutionStatus::Running, ExecutionStatus::Completed, ExecutionStatus::Failed] {
            assert_eq!(ExecutionStatus::parse(&status.to_string()).unwrap(), status);
        }
        assert!(ExecutionStatus::parse("crashed").is_err());
    }

    #[test]
    fn test_run_outcome_truncates_error() {
        let long = "x".repeat(2000);
        let outcome = RunOutcome::failed(long);
        assert_eq!(outcome.error_message.unwrap().len(), ERROR_MESSAGE_MAX);
    }

    #[test]
    fn test_run_outcome_truncates_on_char_boundary() {
        // Multi-byte chars around the cut point must not split
        let long = "é".repeat(ERROR_MESSAGE_MAX);
        let outcome = RunOutcome::failed(long);
        let message = outcome.error_message.unwrap();
        assert!(message.len() <= ERROR_MESSAGE_MAX);
        assert!(message.is_char_boundary(message.len()));
    }

    #[test]
    fn test_budget_window_rate() {
        let window = BudgetWindow {
            rate_count: 2,
            rate_limit: 3,
            cost_sum: 0.0,
            cost_limit: 5.0,
            projected_cost: 0.0,
        };
        assert!(window.permits_rate());

        let window = BudgetWindow { rate_count: 3, ..window };
        assert!(!window.permits_rate());
    }

    #[test]
    fn test_budget_window_cost_anticipates_next_run() {
        // $5 cap, two $2 runs done: the third would land at $6, so it is
        // rejected before the provider is ever called.
        let window = BudgetWindow {
            rate_count: 0,
            rate_limit: 10,
            cost_sum: 4.0,
            cost_limit: 5.0,
            projected_cost: 2.0,
        };
        assert!(!window.permits_cost());

        // With one $2 run done the second still fits.
        let window = BudgetWindow {
            cost_sum: 2.0,
            ..window
        };
        assert!(window.permits_cost());
    }

    #[test]
    fn test_budget_window_cost_without_history() {
        let window = BudgetWindow {
            rate_count: 0,
            rate_limit: 10,
            cost_sum: 0.0,
            cost_limit: 5.0,
            projected_cost: 0.0,
        };
        assert!(window.permits_cost());
    }

    #[test]
    fn test_admission_rejection_display() {
        assert_eq!(AdmissionRejection::Disabled.to_string(), "disabled");
        assert_eq!(AdmissionRejection::AlreadyRunning.to_string(), "already_running");
        assert_eq!(AdmissionRejection::RateLimited.to_string(), "rate_limited");
        assert_eq!(AdmissionRejection::CostCapped.to_string(), "cost_capped");
    }
}
