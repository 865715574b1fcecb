//! SQLite-backed ledger
//!
//! All control-plane persistence goes through this type. Admission is a
//! single `BEGIN IMMEDIATE` transaction (a conditional write keyed on agent
//! name), so the single-flight invariant holds even when the daemon and a
//! CLI process share the database file.

use std::path::Path;

use eyre::{Context, Result, eyre};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info};

use crate::types::{
    AdmissionRejection, AdmitOutcome, AgentDef, AgentRollup, AgentStatusRow, BudgetWindow, CostReportRow,
    ExecutionRecord, ExecutionStatus, RunOutcome, Schedule,
};
use crate::{HOUR_MS, day_start_ms};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    name                TEXT PRIMARY KEY,
    provider            TEXT NOT NULL,
    model               TEXT NOT NULL,
    temperature         REAL NOT NULL,
    max_tokens          INTEGER NOT NULL,
    prompt              TEXT NOT NULL,
    rate_limit_per_hour INTEGER NOT NULL,
    cost_limit_daily    REAL NOT NULL,
    schedule_type       TEXT NOT NULL,
    schedule_param      TEXT,
    enabled             INTEGER NOT NULL DEFAULT 1,
    paused              INTEGER NOT NULL DEFAULT 0,
    next_run_at         INTEGER,
    last_run_at         INTEGER,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
    id              TEXT PRIMARY KEY,
    agent           TEXT NOT NULL REFERENCES agents(name) ON DELETE RESTRICT,
    status          TEXT NOT NULL,
    source          TEXT NOT NULL,
    started_at      INTEGER NOT NULL,
    finished_at     INTEGER,
    items_processed INTEGER NOT NULL DEFAULT 0,
    items_failed    INTEGER NOT NULL DEFAULT 0,
    duration_ms     INTEGER NOT NULL DEFAULT 0,
    tokens_used     INTEGER NOT NULL DEFAULT 0,
    cost_usd        REAL NOT NULL DEFAULT 0,
    error_message   TEXT
);

CREATE INDEX IF NOT EXISTS idx_executions_agent_started ON executions(agent, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_executions_agent_status ON executions(agent, status);
";

/// Result of a delete_agent call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// Execution records still reference the agent
    HasRecords,
}

/// The execution ledger
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open or create the ledger database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }
        let conn = Connection::open(path).context("Failed to open ledger database")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL journal mode")?;
        Self::init(conn, Some(path))
    }

    /// In-memory ledger for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize schema")?;
        if let Some(path) = path {
            info!(path = %path.display(), "Opened ledger");
        }
        Ok(Self { conn })
    }

    // === Agents ===

    /// Insert a new agent definition; fails if the name is taken
    pub fn create_agent(&self, def: &AgentDef) -> Result<()> {
        debug!(agent = %def.name, "create_agent: called");
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO agents (name, provider, model, temperature, max_tokens, prompt,
                 rate_limit_per_hour, cost_limit_daily, schedule_type, schedule_param,
                 enabled, paused, next_run_at, last_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                def.name,
                def.provider,
                def.model,
                def.temperature,
                def.max_tokens,
                def.prompt,
                def.rate_limit_per_hour,
                def.cost_limit_daily,
                def.schedule.kind(),
                def.schedule.param(),
                def.enabled,
                def.paused,
                def.next_run_at,
                def.last_run_at,
                def.created_at,
                def.updated_at,
            ],
        )?;
        if inserted == 0 {
            return Err(eyre!("Agent already exists: {}", def.name));
        }
        Ok(())
    }

    /// Load one agent definition
    pub fn get_agent(&self, name: &str) -> Result<Option<AgentDef>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, provider, model, temperature, max_tokens, prompt,
                        rate_limit_per_hour, cost_limit_daily, schedule_type, schedule_param,
                        enabled, paused, next_run_at, last_run_at, created_at, updated_at
                 FROM agents WHERE name = ?1",
                params![name],
                agent_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Overwrite an agent's mutable fields; returns false if the agent is unknown
    pub fn update_agent(&self, def: &AgentDef) -> Result<bool> {
        debug!(agent = %def.name, "update_agent: called");
        let changed = self.conn.execute(
            "UPDATE agents SET provider = ?2, model = ?3, temperature = ?4, max_tokens = ?5,
                 prompt = ?6, rate_limit_per_hour = ?7, cost_limit_daily = ?8,
                 schedule_type = ?9, schedule_param = ?10, enabled = ?11, paused = ?12,
                 next_run_at = ?13, last_run_at = ?14, updated_at = ?15
             WHERE name = ?1",
            params![
                def.name,
                def.provider,
                def.model,
                def.temperature,
                def.max_tokens,
                def.prompt,
                def.rate_limit_per_hour,
                def.cost_limit_daily,
                def.schedule.kind(),
                def.schedule.param(),
                def.enabled,
                def.paused,
                def.next_run_at,
                def.last_run_at,
                def.updated_at,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Delete an agent, restricted while execution records reference it
    pub fn delete_agent(&mut self, name: &str) -> Result<DeleteOutcome> {
        debug!(agent = %name, "delete_agent: called");
        let tx = self.conn.transaction()?;
        let records: i64 = tx.query_row(
            "SELECT COUNT(*) FROM executions WHERE agent = ?1",
            params![name],
            |row| row.get(0),
        )?;
        if records > 0 {
            return Ok(DeleteOutcome::HasRecords);
        }
        let deleted = tx.execute("DELETE FROM agents WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(if deleted == 1 {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    /// List all agent definitions, ordered by name
    pub fn list_agents(&self) -> Result<Vec<AgentDef>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, provider, model, temperature, max_tokens, prompt,
                    rate_limit_per_hour, cost_limit_daily, schedule_type, schedule_param,
                    enabled, paused, next_run_at, last_run_at, created_at, updated_at
             FROM agents ORDER BY name",
        )?;
        let rows = stmt.query_map([], agent_from_row)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    /// Flip the enabled flag; returns false if the agent is unknown
    pub fn set_enabled(&self, name: &str, enabled: bool, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE agents SET enabled = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, enabled, now],
        )?;
        Ok(changed == 1)
    }

    /// Flip the paused flag; returns false if the agent is unknown
    pub fn set_paused(&self, name: &str, paused: bool, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE agents SET paused = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, paused, now],
        )?;
        Ok(changed == 1)
    }

    /// Advance the automatic-run clock after a scheduler-initiated run
    pub fn advance_schedule(&self, name: &str, last_run_at: i64, next_run_at: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET last_run_at = ?2, next_run_at = ?3, updated_at = ?2 WHERE name = ?1",
            params![name, last_run_at, next_run_at],
        )?;
        Ok(())
    }

    /// Seed or clear next_run_at without touching last_run_at
    pub fn set_next_run(&self, name: &str, next_run_at: Option<i64>, now: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET next_run_at = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, next_run_at, now],
        )?;
        Ok(())
    }

    // === Admission ===

    /// The admission gate: enabled check, single-flight check, budget check,
    /// and running-record creation as one atomic conditional write.
    ///
    /// Rejections create no record. An unknown agent is an error, not a
    /// rejection.
    pub fn admit_run(&mut self, name: &str, source: &str, now: i64) -> Result<AdmitOutcome> {
        debug!(agent = %name, %source, "admit_run: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let def = tx
            .query_row(
                "SELECT name, provider, model, temperature, max_tokens, prompt,
                        rate_limit_per_hour, cost_limit_daily, schedule_type, schedule_param,
                        enabled, paused, next_run_at, last_run_at, created_at, updated_at
                 FROM agents WHERE name = ?1",
                params![name],
                agent_from_row,
            )
            .optional()?
            .ok_or_else(|| eyre!("Unknown agent: {}", name))?;

        if !def.enabled {
            debug!(agent = %name, "admit_run: rejected, disabled");
            return Ok(AdmitOutcome::Rejected(AdmissionRejection::Disabled));
        }

        let running: i64 = tx.query_row(
            "SELECT COUNT(*) FROM executions WHERE agent = ?1 AND status = 'running'",
            params![name],
            |row| row.get(0),
        )?;
        if running > 0 {
            debug!(agent = %name, "admit_run: rejected, already running");
            return Ok(AdmitOutcome::Rejected(AdmissionRejection::AlreadyRunning));
        }

        let window = budget_window_inner(&tx, &def, now)?;
        if !window.permits_rate() {
            debug!(agent = %name, rate_count = window.rate_count, "admit_run: rejected, rate limited");
            return Ok(AdmitOutcome::Rejected(AdmissionRejection::RateLimited));
        }
        if !window.permits_cost() {
            debug!(agent = %name, cost_sum = window.cost_sum, "admit_run: rejected, cost capped");
            return Ok(AdmitOutcome::Rejected(AdmissionRejection::CostCapped));
        }

        let record = ExecutionRecord::start(name, source, now);
        tx.execute(
            "INSERT INTO executions (id, agent, status, source, started_at) VALUES (?1, ?2, 'running', ?3, ?4)",
            params![record.id, record.agent, record.source, record.started_at],
        )?;
        tx.commit()?;

        debug!(agent = %name, execution_id = %record.id, "admit_run: admitted");
        Ok(AdmitOutcome::Admitted(record))
    }

    /// Current budget window for an agent (for display; admission evaluates
    /// its own copy inside the transaction)
    pub fn budget_window(&self, name: &str, now: i64) -> Result<Option<BudgetWindow>> {
        let Some(def) = self.get_agent(name)? else {
            return Ok(None);
        };
        Ok(Some(budget_window_inner(&self.conn, &def, now)?))
    }

    // === Execution records ===

    /// Apply a terminal outcome to a running record
    ///
    /// Returns false when the record does not exist or is already terminal;
    /// a finalized record is never overwritten.
    pub fn finalize_run(&self, id: &str, outcome: &RunOutcome, finished_at: i64) -> Result<bool> {
        debug!(execution_id = %id, status = %outcome.status, "finalize_run: called");
        if !outcome.status.is_terminal() {
            return Err(eyre!("finalize_run requires a terminal status, got {}", outcome.status));
        }
        let changed = self.conn.execute(
            "UPDATE executions
             SET status = ?2, finished_at = ?3, duration_ms = ?3 - started_at,
                 items_processed = ?4, items_failed = ?5, tokens_used = ?6,
                 cost_usd = ?7, error_message = ?8
             WHERE id = ?1 AND status = 'running'",
            params![
                id,
                outcome.status.to_string(),
                finished_at,
                outcome.items_processed,
                outcome.items_failed,
                outcome.tokens_used,
                outcome.cost_usd,
                outcome.error_message,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Load one execution record
    pub fn get_record(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM executions WHERE id = ?1"),
                params![id],
                record_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent record for an agent, running or terminal
    pub fn latest_record(&self, agent: &str) -> Result<Option<ExecutionRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM executions WHERE agent = ?1 ORDER BY started_at DESC LIMIT 1"),
                params![agent],
                record_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The agent's running record, if any
    pub fn running_record(&self, agent: &str) -> Result<Option<ExecutionRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM executions WHERE agent = ?1 AND status = 'running' LIMIT 1"),
                params![agent],
                record_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Page through an agent's records, newest first, with the total count
    pub fn list_records(
        &self,
        agent: &str,
        limit: u32,
        offset: u32,
        status: Option<ExecutionStatus>,
    ) -> Result<(Vec<ExecutionRecord>, u64)> {
        let (records, total) = match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM executions
                     WHERE agent = ?1 AND status = ?2
                     ORDER BY started_at DESC LIMIT ?3 OFFSET ?4"
                ))?;
                let rows = stmt.query_map(params![agent, status.to_string(), limit, offset], record_from_row)?;
                let records: rusqlite::Result<Vec<_>> = rows.collect();
                let total: u64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM executions WHERE agent = ?1 AND status = ?2",
                    params![agent, status.to_string()],
                    |row| Ok(row.get::<_, i64>(0)? as u64),
                )?;
                (records?, total)
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM executions
                     WHERE agent = ?1 ORDER BY started_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(params![agent, limit, offset], record_from_row)?;
                let records: rusqlite::Result<Vec<_>> = rows.collect();
                let total: u64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM executions WHERE agent = ?1",
                    params![agent],
                    |row| Ok(row.get::<_, i64>(0)? as u64),
                )?;
                (records?, total)
            }
        };
        Ok((records, total))
    }

    /// Fail every record left `running` by a previous process
    ///
    /// Called once on daemon startup; keeps the single-running-record
    /// invariant true across restarts.
    pub fn sweep_orphaned_running(&self, message: &str, now: i64) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE executions
             SET status = 'failed', finished_at = ?1, duration_ms = ?1 - started_at, error_message = ?2
             WHERE status = 'running'",
            params![now, message],
        )?;
        if changed > 0 {
            info!(count = changed, "Swept orphaned running records");
        }
        Ok(changed)
    }

    // === Aggregates (telemetry / reporting) ===

    /// Latest record per agent as one aggregate query, not N per-agent reads
    pub fn status_snapshot(&self) -> Result<Vec<AgentStatusRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.agent, e.status, e.started_at, e.error_message
             FROM executions e
             JOIN (SELECT agent, MAX(started_at) AS latest FROM executions GROUP BY agent) m
               ON e.agent = m.agent AND e.started_at = m.latest
             ORDER BY e.agent",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (agent, status, last_started_at, last_error) = row?;
            out.push(AgentStatusRow {
                agent,
                last_status: ExecutionStatus::parse(&status)?,
                last_started_at,
                last_error,
            });
        }
        Ok(out)
    }

    /// Per-agent execution/items/cost/error counters since `since`
    pub fn rollups_since(&self, since: i64) -> Result<Vec<AgentRollup>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent, COUNT(*), COALESCE(SUM(items_processed), 0), COALESCE(SUM(cost_usd), 0.0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM executions WHERE started_at >= ?1 GROUP BY agent ORDER BY agent",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok(AgentRollup {
                agent: row.get(0)?,
                executions: row.get::<_, i64>(1)? as u64,
                items_processed: row.get(2)?,
                cost_usd: row.get(3)?,
                errors: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Cost/tokens/execution-count grouped by agent, optionally bounded below
    pub fn cost_report(&self, since: Option<i64>) -> Result<Vec<CostReportRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent, COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(tokens_used), 0), COALESCE(SUM(cost_usd), 0.0)
             FROM executions WHERE started_at >= ?1 GROUP BY agent ORDER BY agent",
        )?;
        let rows = stmt.query_map(params![since.unwrap_or(0)], |row| {
            Ok(CostReportRow {
                agent: row.get(0)?,
                executions: row.get::<_, i64>(1)? as u64,
                failures: row.get::<_, i64>(2)? as u64,
                tokens_used: row.get(3)?,
                cost_usd: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

const RECORD_COLUMNS: &str = "id, agent, status, source, started_at, finished_at, items_processed, \
                              items_failed, duration_ms, tokens_used, cost_usd, error_message";

/// Compute the budget window with the connection (or transaction) at hand
fn budget_window_inner(conn: &Connection, def: &AgentDef, now: i64) -> Result<BudgetWindow> {
    let rate_count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM executions WHERE agent = ?1 AND started_at > ?2",
        params![def.name, now - HOUR_MS],
        |row| row.get(0),
    )?;
    let cost_sum: f64 = conn.query_row(
        "SELECT COALESCE(SUM(cost_usd), 0.0) FROM executions WHERE agent = ?1 AND started_at >= ?2",
        params![def.name, day_start_ms(now)],
        |row| row.get(0),
    )?;
    let projected_cost: f64 = conn
        .query_row(
            "SELECT cost_usd FROM executions WHERE agent = ?1 AND status = 'completed'
             ORDER BY started_at DESC LIMIT 1",
            params![def.name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0.0);
    Ok(BudgetWindow {
        rate_count,
        rate_limit: def.rate_limit_per_hour,
        cost_sum,
        cost_limit: def.cost_limit_daily,
        projected_cost,
    })
}

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentDef> {
    let schedule_type: String = row.get(8)?;
    let schedule_param: Option<String> = row.get(9)?;
    let schedule = Schedule::from_parts(&schedule_type, schedule_param.as_deref())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, e.into()))?;
    Ok(AgentDef {
        name: row.get(0)?,
        provider: row.get(1)?,
        model: row.get(2)?,
        temperature: row.get(3)?,
        max_tokens: row.get(4)?,
        prompt: row.get(5)?,
        rate_limit_per_hour: row.get(6)?,
        cost_limit_daily: row.get(7)?,
        schedule,
        enabled: row.get(10)?,
        paused: row.get(11)?,
        next_run_at: row.get(12)?,
        last_run_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get(2)?;
    let status = ExecutionStatus::parse(&status)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into()))?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        agent: row.get(1)?,
        status,
        source: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        items_processed: row.get(6)?,
        items_failed: row.get(7)?,
        duration_ms: row.get(8)?,
        tokens_used: row.get(9)?,
        cost_usd: row.get(10)?,
        error_message: row.get(11)?,
    })
}
